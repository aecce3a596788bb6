use super::value::{NativeFn, Object, Value};
use super::vm::Vm;
use rand::Rng;
use std::{
    cell::RefCell,
    process::Command,
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

fn check_arity(name: &str, expected: usize, argc: usize) -> Result<(), String> {
    if argc == expected {
        Ok(())
    } else {
        Err(format!(
            "{name}() takes {expected} arguments but got {argc}."
        ))
    }
}

fn nth_array(name: &str, args: &[Value], idx: usize) -> Result<Rc<RefCell<Vec<Value>>>, String> {
    match &args[idx] {
        Value::Object(Object::Array(items)) => Ok(Rc::clone(items)),
        other => Err(format!(
            "Argument {} to {name}() must be an array, not {}.",
            idx + 1,
            other.type_name()
        )),
    }
}

fn nth_string(name: &str, args: &[Value], idx: usize) -> Result<Rc<str>, String> {
    match &args[idx] {
        Value::Object(Object::String(s)) => Ok(Rc::clone(s)),
        other => Err(format!(
            "Argument {} to {name}() must be a string, not {}.",
            idx + 1,
            other.type_name()
        )),
    }
}

/// Seconds since the interpreter started.
fn clock(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("clock", 0, args.len())?;
    Ok(Value::Number(vm.uptime()))
}

/// Wall-clock seconds since the Unix epoch.
fn time(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("time", 0, args.len())?;
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    Ok(Value::Number(seconds))
}

/// Runs a command through the host shell and returns its exit status.
fn term(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("term", 1, args.len())?;
    let cmd = nth_string("term", args, 0)?;
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd.as_ref())
        .status()
        .map_err(|err| format!("Cannot run command: {err}."))?;
    Ok(Value::Number(status.code().unwrap_or(-1) as f64))
}

fn length(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("length", 1, args.len())?;
    let len = match &args[0] {
        Value::Object(Object::String(s)) => s.len(),
        Value::Object(Object::Array(items)) => items.borrow().len(),
        Value::Object(Object::Dict(entries)) => entries.borrow().len(),
        other => {
            return Err(format!(
                "Argument 1 to length() must be a string, array, or dict, not {}.",
                other.type_name()
            ))
        }
    };
    Ok(Value::Number(len as f64))
}

fn append(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("append", 2, args.len())?;
    let items = nth_array("append", args, 0)?;
    items.borrow_mut().push(args[1].clone());
    Ok(Value::Nil)
}

fn prepend(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("prepend", 2, args.len())?;
    let items = nth_array("prepend", args, 0)?;
    items.borrow_mut().insert(0, args[1].clone());
    Ok(Value::Nil)
}

/// Removes and returns the first element.
fn head(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("head", 1, args.len())?;
    let items = nth_array("head", args, 0)?;
    let mut items = items.borrow_mut();
    if items.is_empty() {
        return Err("Cannot take the head of an empty array.".to_string());
    }
    Ok(items.remove(0))
}

/// Removes and returns the last element.
fn tail(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("tail", 1, args.len())?;
    let items = nth_array("tail", args, 0)?;
    let popped = items.borrow_mut().pop();
    popped.ok_or_else(|| "Cannot take the tail of an empty array.".to_string())
}

/// A new array without the first element; the original is untouched.
fn rest(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("rest", 1, args.len())?;
    let items = nth_array("rest", args, 0)?;
    let items = items.borrow();
    if items.is_empty() {
        return Err("Cannot take the rest of an empty array.".to_string());
    }
    Ok(Value::array(items[1..].to_vec()))
}

/// Removes a key from a dict; hands back the removed value, or nil when
/// the key was absent.
fn remove(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("remove", 2, args.len())?;
    let entries = match &args[0] {
        Value::Object(Object::Dict(entries)) => Rc::clone(entries),
        other => {
            return Err(format!(
                "Argument 1 to remove() must be a dict, not {}.",
                other.type_name()
            ))
        }
    };
    let key = nth_string("remove", args, 1)?;
    let removed = entries.borrow_mut().remove(key.as_ref());
    Ok(removed.unwrap_or(Value::Nil))
}

fn random(_: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("random", 0, args.len())?;
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen::<f64>()))
}

pub const NATIVES: [(&str, NativeFn); 11] = [
    ("clock", clock),
    ("time", time),
    ("term", term),
    ("length", length),
    ("append", append),
    ("prepend", prepend),
    ("head", head),
    ("tail", tail),
    ("rest", rest),
    ("remove", remove),
    ("random", random),
];
