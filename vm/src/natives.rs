use compiler::{NativeObj, Value};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// `clock() -> seconds`. Wall-clock seconds since the Unix epoch, as a float.
fn clock(_args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// `substring(s, start, end) -> string`. Half-open `[start, end)` over
/// characters, not bytes, so multi-byte text indexes the way a script author
/// expects.
fn substring(args: &[Value]) -> Result<Value, String> {
    let s = args[0]
        .as_str()
        .ok_or_else(|| "substring: first argument must be a string".to_string())?;
    let start = args[1]
        .as_number()
        .ok_or_else(|| "substring: start must be a number".to_string())?;
    let end = args[2]
        .as_number()
        .ok_or_else(|| "substring: end must be a number".to_string())?;
    if start.fract() != 0.0 || end.fract() != 0.0 || start < 0.0 || end < 0.0 {
        return Err("substring: start and end must be non-negative integers".to_string());
    }
    let chars: Vec<char> = s.chars().collect();
    let start = start as usize;
    let end = end as usize;
    if start > end || end > chars.len() {
        return Err("substring: index out of bounds".to_string());
    }
    let out: String = chars[start..end].iter().collect();
    Ok(Value::string(out))
}

/// `size(seq) -> number`. Works on both strings (character count) and lists.
fn size(args: &[Value]) -> Result<Value, String> {
    if let Some(s) = args[0].as_str() {
        return Ok(Value::Number(s.chars().count() as f64));
    }
    if let Some(list) = args[0].as_list() {
        return Ok(Value::Number(list.borrow().len() as f64));
    }
    Err(format!("size: expected a string or list, got {}", args[0].type_name()))
}

/// Builds the fixed set of host builtins installed as globals at VM
/// construction. Adding one is a one-liner here.
pub fn registry() -> Vec<Rc<NativeObj>> {
    vec![
        Rc::new(NativeObj {
            name: Rc::from("clock"),
            arity: 0,
            function: clock,
        }),
        Rc::new(NativeObj {
            name: Rc::from("substring"),
            arity: 3,
            function: substring,
        }),
        Rc::new(NativeObj {
            name: Rc::from("size"),
            arity: 1,
            function: size,
        }),
    ]
}
