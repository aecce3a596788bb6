use path_absolutize::Absolutize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Hands `import` the source text for a module name. The core never touches
/// the filesystem itself.
pub trait ModuleLoader {
    fn load(&self, name: &str) -> Result<String, String>;
}

/// Resolves `<name>.embr` relative to the importing file (or the working
/// directory when running the REPL).
pub struct FileLoader {
    dir: Option<PathBuf>,
}

impl FileLoader {
    pub fn new(script: Option<&Path>) -> Self {
        Self {
            dir: script.and_then(|path| path.parent().map(Path::to_owned)),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, String> {
        let mut path = PathBuf::from(name);
        path.set_extension("embr");
        let path = match &self.dir {
            Some(dir) => dir.join(path),
            None => path,
        };
        let path = path
            .absolutize()
            .map_err(|err| format!("Cannot resolve module '{name}': {err}."))?;
        if !path.is_file() {
            return Err(format!("No module named '{name}'."));
        }
        Ok(path.into_owned())
    }
}

impl ModuleLoader for FileLoader {
    fn load(&self, name: &str) -> Result<String, String> {
        let path = self.resolve(name)?;
        fs::read_to_string(&path).map_err(|err| format!("Cannot read module '{name}': {err}."))
    }
}

/// A loader with no modules, for sources that must not import.
pub struct NoModules;

impl ModuleLoader for NoModules {
    fn load(&self, name: &str) -> Result<String, String> {
        Err(format!("No module named '{name}'."))
    }
}
