// Integration tests exercising the compiler and VM together as a black box
// through the public `coyote` crate API: compile a source program to a
// `Chunk`, run it on a fresh `Vm`, and inspect the resulting global state.
// `print`'s output goes to stdout and isn't captured here; these tests
// assert on the VM's globals instead, which the source programs route
// their observable results through.

use coyote::compiler::Compiler;
use coyote::natives_builtin;
use coyote::value::Value;
use coyote::vm::Vm;

fn run(source: &str) -> Vm {
    let natives = natives_builtin::registry();
    let chunk = Compiler::compile(source, &natives).expect("program should compile");
    let mut vm = Vm::new(natives);
    vm.interpret(chunk).expect("program should run to completion");
    vm
}

fn expect_compile_error(source: &str) {
    let natives = natives_builtin::registry();
    assert!(Compiler::compile(source, &natives).is_err(), "expected a compile error for: {source}");
}

#[test]
fn arithmetic_and_print() {
    let vm = run("var x = 2 + 3 * 4\nprint x");
    assert_eq!(vm.globals()[0], Value::Integer(14));
}

#[test]
fn for_loop_prints_each_iteration_and_frees_its_register() {
    let vm = run("var total = 0\nfor i = 1 to 3 {\n total = total + i\n}\nvar after = 1\nfor j = 1 to 2 {\n after = after + j\n}");
    assert_eq!(vm.globals()[0], Value::Integer(6)); // total: 1+2+3
    assert_eq!(vm.globals()[1], Value::Integer(4)); // after: 1+1+2, register reused fine
}

#[test]
fn return_inside_a_for_loop_unwinds_the_enclosing_function() {
    let vm = run(
        "var find = func() int {\n for i = 1 to 10 {\n if i == 5 {\n return i\n }\n }\n return 0\n}\nvar result = find()",
    );
    assert_eq!(vm.globals()[1], Value::Integer(5));
}

#[test]
fn return_inside_a_scan_loop_unwinds_the_enclosing_function() {
    let vm = run(
        "var find = func() int {\n scan @[1, 2, 3, 4] to v {\n if v == 3 {\n return v\n }\n }\n return 0\n}\nvar result = find()",
    );
    assert_eq!(vm.globals()[1], Value::Integer(3));
}

#[test]
fn top_level_global_reassignment_leaves_the_stack_balanced() {
    let vm = run("var x = 1\nx = 2\nvar y = x + 1");
    assert_eq!(vm.globals()[0], Value::Integer(2));
    assert_eq!(vm.globals()[1], Value::Integer(3));
}

#[test]
fn top_level_var_redeclaration_leaves_the_stack_balanced() {
    let vm = run("var x = 1\nvar x = 2\nvar y = x + 1");
    assert_eq!(vm.globals()[0], Value::Integer(2));
    assert_eq!(vm.globals()[1], Value::Integer(3));
}

#[test]
fn closure_captures_argument_across_a_nested_return() {
    let vm = run(
        "var mk = func(a: int) func() int {\n return func() int {\n return a + 1\n }\n}\nvar f = mk(41)()",
    );
    assert_eq!(vm.globals()[1], Value::Integer(42));
}

#[test]
fn scan_iterates_array_elements_in_order() {
    let vm = run("var total = 0\nscan @[10, 20, 30] to v {\n total = total + v\n}");
    assert_eq!(vm.globals()[0], Value::Integer(60));
}

#[test]
fn class_field_and_method_mutate_instance_state() {
    let vm = run(
        "class C {\n x: int\n inc() {\n this.x = this.x + 1\n }\n}\nvar o = new C()\no.x = 0\no.inc()\no.inc()\nvar r = o.x",
    );
    // globals: 0 = the class C itself, 1 = o, 2 = r
    assert_eq!(vm.globals()[2], Value::Integer(2));
}

#[test]
fn sql_create_insert_select_round_trips_through_dataframe() {
    let vm = run(
        "create table T (a int, b string)\ninsert into T values (1, \"hi\")\nvar r = select a, b from T",
    );
    match &vm.globals()[0] {
        Value::DataFrame(frame) => {
            let frame = frame.borrow();
            assert_eq!(frame.rows.len(), 1);
            assert_eq!(frame.rows[0][0], Value::Integer(1));
            assert_eq!(frame.rows[0][1], Value::string("hi"));
        }
        other => panic!("expected a DataFrame, got {other:?}"),
    }
}

#[test]
fn break_exits_a_for_loop_early() {
    let vm = run("var total = 0\nfor i = 1 to 10 {\n if i == 4 {\n break\n }\n total = total + i\n}");
    assert_eq!(vm.globals()[0], Value::Integer(6)); // 1+2+3, stops before 4
}

#[test]
fn while_loop_with_continue_skips_even_numbers() {
    let vm = run(
        "var i = 0\nvar total = 0\nwhile i < 6 {\n i = i + 1\n if i % 2 == 0 {\n continue\n }\n total = total + i\n}",
    );
    assert_eq!(vm.globals()[1], Value::Integer(9)); // 1+3+5
}

#[test]
fn switch_runs_the_first_matching_when_arm() {
    let vm = run("var x = 2\nvar out = 0\nswitch x {\nwhen 1 {\n out = 100\n}\nwhen 2 {\n out = 200\n}\ndefault {\n out = -1\n}\n}");
    assert_eq!(vm.globals()[1], Value::Integer(200));
}

#[test]
fn switch_falls_through_with_no_side_effect_when_nothing_matches() {
    let vm = run("var x = 99\nvar out = 0\nswitch x {\nwhen 1 {\n out = 100\n}\n}");
    assert_eq!(vm.globals()[1], Value::Integer(0));
}

#[test]
fn enum_tag_round_trips_through_double_colon() {
    let vm = run("enum Color {\nRed, Green, Blue\n}\nvar c = Color::Green");
    match &vm.globals()[0] {
        Value::Enum(def, tag) => {
            assert_eq!(def.name, "Color");
            assert_eq!(def.variants[*tag as usize], "Green");
        }
        other => panic!("expected an Enum value, got {other:?}"),
    }
}

#[test]
fn multidimensional_array_index_round_trips() {
    let vm = run(
        "var grid = @[1, 2, 3, 4, 5, 6]\nvar first = grid[0]\nvar last = grid[5]",
    );
    assert_eq!(vm.globals()[1], Value::Integer(1));
    assert_eq!(vm.globals()[2], Value::Integer(6));
}

#[test]
fn list_key_access_reads_back_a_stored_value() {
    let vm = run("var m = @{\"a\": 1, \"b\": 2}\nvar v = m$b");
    assert_eq!(vm.globals()[1], Value::Integer(2));
}

#[test]
fn native_len_reports_array_and_string_length() {
    let vm = run("var n = len(@[1, 2, 3])\nvar s = len(\"hello\")");
    assert_eq!(vm.globals()[0], Value::Integer(3));
    assert_eq!(vm.globals()[1], Value::Integer(5));
}

#[test]
fn string_concatenation_uses_the_specialized_sadd_opcode() {
    let vm = run(r#"var greeting = "hello, " + "world""#);
    assert_eq!(vm.globals()[0], Value::string("hello, world"));
}

#[test]
fn undeclared_variable_is_a_compile_error() {
    expect_compile_error("print undeclared_name");
}

#[test]
fn too_many_arguments_is_a_compile_error() {
    let args = (0..256).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
    let source = format!("var f = func() {{ }}\nf({args})");
    expect_compile_error(&source);
}

#[test]
fn type_mismatch_on_reassignment_is_a_compile_error() {
    expect_compile_error("var x = 1\nx = \"oops\"");
}

#[test]
fn assignment_to_a_non_lvalue_is_a_compile_error() {
    expect_compile_error("1 + 2 = 3");
}
