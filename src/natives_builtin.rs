// File: src/natives_builtin.rs
//
// A small demonstration native registry: `print`, `len`, `type_of`, `str`.
// Shows the native-function protocol end to end without pretending to be a
// standard library — a real embedder registers its own natives the same
// way `registry()` does here.

use crate::errors::RuntimeError;
use crate::native::{NativeEntry, NativeRegistry};
use crate::value::Value;
use crate::vm::Vm;

fn native_print(vm: &mut Vm, arg_count: u16, base_sp: usize) -> Result<Option<Value>, RuntimeError> {
    let mut parts = Vec::with_capacity(arg_count as usize);
    for i in 0..arg_count as usize {
        parts.push(vm.stack[base_sp + i].to_string());
    }
    println!("{}", parts.join(" "));
    Ok(None)
}

fn native_len(vm: &mut Vm, arg_count: u16, base_sp: usize) -> Result<Option<Value>, RuntimeError> {
    if arg_count != 1 {
        return Err(RuntimeError::new("len expects exactly one argument", vm.current_line()));
    }
    let value = &vm.stack[base_sp];
    let len = match value {
        Value::Str(s) => s.chars().count() as i64,
        Value::Array { elements, .. } => elements.borrow().len() as i64,
        Value::List { map, .. } => map.borrow().len() as i64,
        other => {
            return Err(RuntimeError::new(
                format!("len is not defined for {}", other.kind()),
                vm.current_line(),
            ))
        }
    };
    Ok(Some(Value::Integer(len)))
}

fn native_type_of(vm: &mut Vm, arg_count: u16, base_sp: usize) -> Result<Option<Value>, RuntimeError> {
    if arg_count != 1 {
        return Err(RuntimeError::new("type_of expects exactly one argument", vm.current_line()));
    }
    Ok(Some(Value::string(vm.stack[base_sp].kind().to_string())))
}

fn native_str(vm: &mut Vm, arg_count: u16, base_sp: usize) -> Result<Option<Value>, RuntimeError> {
    if arg_count != 1 {
        return Err(RuntimeError::new("str expects exactly one argument", vm.current_line()));
    }
    Ok(Some(Value::string(vm.stack[base_sp].to_string())))
}

/// Builds the default native registry handed to `coyote::run` and the CLI.
/// `print` is the only native without a return value; the others all
/// report `has_return: true`.
pub fn registry() -> NativeRegistry {
    let mut reg = NativeRegistry::new();
    reg.register(NativeEntry { name: "print", arity: None, has_return: false, func: native_print });
    reg.register(NativeEntry { name: "len", arity: Some(1), has_return: true, func: native_len });
    reg.register(NativeEntry { name: "type_of", arity: Some(1), has_return: true, func: native_type_of });
    reg.register(NativeEntry { name: "str", arity: Some(1), has_return: true, func: native_str });
    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_carries_the_four_demonstration_natives() {
        let reg = registry();
        assert!(reg.contains("print"));
        assert!(reg.contains("len"));
        assert!(reg.contains("type_of"));
        assert!(reg.contains("str"));
    }

    #[test]
    fn print_is_the_only_void_native() {
        let reg = registry();
        assert!(!reg.get("print").unwrap().has_return);
        assert!(reg.get("len").unwrap().has_return);
    }
}
