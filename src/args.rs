use std::convert::TryFrom;
use std::{env, fmt, path::PathBuf};

#[derive(Debug, Clone)]
enum Setting {
    Version,
    Help,
    Unknown(String),
}

const VERSION: &str = "--version";
const HELP: &str = "--help";

impl From<String> for Setting {
    fn from(value: String) -> Self {
        match value.as_str() {
            VERSION => Self::Version,
            HELP => Self::Help,
            _ => Self::Unknown(value),
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    Setting(Setting),
    Path(PathBuf),
}

fn lex(iter: &mut env::Args) -> Vec<Token> {
    iter.next();
    let mut tokens = vec![];
    for string in iter {
        if string.starts_with("--") {
            tokens.push(Token::Setting(Setting::from(string)));
        } else {
            tokens.push(Token::Path(PathBuf::from(string)));
        }
    }
    tokens
}

#[derive(Debug, Clone)]
struct Args {
    settings: Vec<Setting>,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ParseError {
    ExpectedPathOrSetting(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ExpectedPathOrSetting(string) => {
                write!(f, "Expected a file path or a setting, got \"{string}\".")
            }
        }
    }
}

fn parse(tokens: Vec<Token>) -> Result<Args, ParseError> {
    let mut iter = tokens.into_iter().peekable();
    let mut settings = vec![];
    while let Some(Token::Setting(setting)) = iter.peek() {
        if let Setting::Unknown(string) = setting {
            return Err(ParseError::ExpectedPathOrSetting(string.clone()));
        }
        settings.push(setting.clone());
        iter.next();
    }
    let path = match iter.next() {
        Some(Token::Path(path)) => Some(path),
        _ => None,
    };
    Ok(Args { settings, path })
}

#[derive(Debug, Clone)]
pub enum EvalMode {
    File(PathBuf),
    Repl,
}

#[derive(Debug, Clone)]
pub enum Action {
    Eval(EvalMode),
    Version,
    Help,
}

impl TryFrom<Args> for Action {
    type Error = ParseError;

    fn try_from(value: Args) -> Result<Self, Self::Error> {
        for setting in value.settings {
            match setting {
                Setting::Help => return Ok(Self::Help),
                Setting::Version => return Ok(Self::Version),
                Setting::Unknown(_) => unreachable!(),
            }
        }
        Ok(match value.path {
            Some(path) => Self::Eval(EvalMode::File(path)),
            None => Self::Eval(EvalMode::Repl),
        })
    }
}

pub fn get_action() -> Result<Action, ParseError> {
    let tokens = lex(&mut env::args());
    let args = parse(tokens)?;
    Action::try_from(args)
}
