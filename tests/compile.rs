//! End-to-end compilation scenarios driven through the public `compile`
//! entry point, with hand-built ASTs standing in for parser output.

use bcpl_codegen::ast::{
    AllocKind, BinOp, ClassDecl, ClassMember, Decl, Expr, ForEachStmt, ForStmt, FunctionDecl,
    LetDecl, Program, RoutineDecl, Stmt, SwitchCase, Visibility,
};
use bcpl_codegen::result::CompileError;
use bcpl_codegen::settings::Flags;
use bcpl_codegen::{compile, CompiledProgram};

fn no_samm() -> Flags {
    Flags {
        samm_enabled: false,
        ..Flags::default()
    }
}

fn member(decl: Decl) -> ClassMember {
    ClassMember {
        declaration: decl,
        visibility: Visibility::Public,
    }
}

fn routine(name: &str, parameters: Vec<&str>, body: Stmt) -> Decl {
    Decl::Routine(RoutineDecl {
        name: name.into(),
        parameters: parameters.into_iter().map(String::from).collect(),
        body,
        is_virtual: false,
        is_final: false,
    })
}

fn block(declarations: Vec<Decl>, statements: Vec<Stmt>) -> Stmt {
    Stmt::Block {
        declarations,
        statements,
    }
}

fn let_decl(name: &str, init: Expr) -> Decl {
    Decl::Let(LetDecl {
        names: vec![name.into()],
        initializers: vec![Some(init)],
        is_float: false,
    })
}

fn compiled_text(output: &CompiledProgram) -> String {
    output.text_listing().join("\n")
}

// ----------------------------------------------------------------------
// S1: trivial method

#[test]
fn s1_trivial_accessor_compiles_to_load_and_ret() {
    let mut program = Program::new(vec![Decl::Class(ClassDecl {
        name: "Point".into(),
        parent_class_name: String::new(),
        members: vec![
            member(Decl::Let(LetDecl {
                names: vec!["x".into()],
                initializers: vec![None],
                is_float: false,
            })),
            member(Decl::Function(FunctionDecl {
                name: "getX".into(),
                parameters: vec![],
                body: Expr::Valof(Box::new(Stmt::Resultis(Expr::member(
                    Expr::var("_this"),
                    "x",
                )))),
                is_float_function: false,
                is_virtual: false,
                is_final: false,
            })),
        ],
    })]);
    let output = compile(&mut program, &Flags::default()).unwrap();
    let body = output.stream.listing_after_label("Point::getX");
    assert_eq!(body, vec!["ldr x0, [x0, #8]".to_string(), "ret".to_string()]);
}

#[test]
fn s1_float_trivial_accessor_returns_in_d0() {
    let mut program = Program::new(vec![Decl::Class(ClassDecl {
        name: "Sample".into(),
        parent_class_name: String::new(),
        members: vec![
            member(Decl::Let(LetDecl {
                names: vec!["fx".into()],
                initializers: vec![None],
                is_float: true,
            })),
            member(Decl::Function(FunctionDecl {
                name: "getFx".into(),
                parameters: vec![],
                body: Expr::FloatValof(Box::new(Stmt::Resultis(Expr::member(
                    Expr::var("_this"),
                    "fx",
                )))),
                is_float_function: true,
                is_virtual: false,
                is_final: false,
            })),
        ],
    })]);
    let output = compile(&mut program, &Flags::default()).unwrap();
    let body = output.stream.listing_after_label("Sample::getFx");
    assert_eq!(body, vec!["ldr d0, [x0, #8]".to_string(), "ret".to_string()]);
}

// ----------------------------------------------------------------------
// S2: FOR over a constant range

#[test]
fn s2_for_header_compares_against_immediate() {
    let mut program = Program::new(vec![routine(
        "count",
        vec![],
        Stmt::For(ForStmt {
            loop_variable: "i".into(),
            unique_loop_variable_name: "i".into(),
            start: Expr::number(1),
            end: Expr::number(3),
            step: None,
            body: Box::new(Stmt::call("WRITEN", vec![Expr::var("i")])),
            is_end_expr_constant: false,
            constant_end_value: 0,
        }),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    // The loop bound is an immediate compare, not a loaded register.
    assert!(text.contains(", #3"), "missing immediate compare:\n{text}");
    let cmp_line = output
        .text_listing()
        .into_iter()
        .find(|l| l.starts_with("cmp") && l.ends_with("#3"))
        .expect("cmp-immediate against the bound");
    assert!(cmp_line.starts_with("cmp "));
    // The exit edge is taken on greater-than.
    assert!(
        output
            .text_listing()
            .iter()
            .any(|l| l.starts_with("b.gt") && l.contains("ForExit")),
        "missing b.gt to the loop exit:\n{text}"
    );
}

// ----------------------------------------------------------------------
// S3: FOREACH over an empty VEC literal is elided

#[test]
fn s3_foreach_over_empty_vec_is_elided() {
    let mut program = Program::new(vec![routine(
        "f",
        vec![],
        Stmt::Compound(vec![
            Stmt::ForEach(ForEachStmt {
                vars: vec!["x".into()],
                collection: Expr::Alloc {
                    kind: AllocKind::Vec,
                    size: Box::new(Expr::number(0)),
                },
                body: Box::new(Stmt::call("WRITEN", vec![Expr::var("x")])),
            }),
            Stmt::call("WRITES", vec![Expr::StringLit("done".into())]),
        ]),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    assert!(
        !text.contains("ForEachHeader"),
        "loop blocks were generated for an empty literal:\n{text}"
    );
    assert!(text.contains("veneer_WRITES"));
}

// ----------------------------------------------------------------------
// S4: inheritance with a user RELEASE

#[test]
fn s4_user_release_chains_to_super_without_samm() {
    let mut program = Program::new(vec![
        Decl::Class(ClassDecl {
            name: "A".into(),
            parent_class_name: String::new(),
            members: vec![],
        }),
        Decl::Class(ClassDecl {
            name: "B".into(),
            parent_class_name: "A".into(),
            members: vec![member(routine(
                "RELEASE",
                vec![],
                Stmt::Compound(vec![Stmt::call("do_cleanup", vec![])]),
            ))],
        }),
        routine("do_cleanup", vec![], Stmt::Compound(vec![])),
    ]);
    let output = compile(&mut program, &no_samm()).unwrap();
    // The injected SUPER.RELEASE() dispatches through the vtable after the
    // user statements: B::RELEASE must contain an indirect call.
    let body = output.stream.listing_after_label("B::RELEASE");
    assert!(
        body.iter().any(|l| l.starts_with("blr")),
        "no SUPER dispatch in B::RELEASE: {body:?}"
    );
}

#[test]
fn s4_user_release_untouched_under_samm() {
    let mut program = Program::new(vec![Decl::Class(ClassDecl {
        name: "A".into(),
        parent_class_name: String::new(),
        members: vec![member(routine(
            "RELEASE",
            vec![],
            Stmt::Compound(vec![Stmt::call("WRITES", vec![Expr::StringLit("bye".into())])]),
        ))],
    })]);
    let output = compile(&mut program, &Flags::default()).unwrap();
    let body = output.stream.listing_after_label("A::RELEASE");
    // No OBJECT_HEAP_FREE injection under SAMM.
    assert!(
        !body.iter().any(|l| l.contains("OBJECT_HEAP_FREE")),
        "SAMM build injected a legacy free: {body:?}"
    );
}

// ----------------------------------------------------------------------
// S5: PAIR arithmetic and comparisons

fn pair_program(op: BinOp) -> Program {
    Program::new(vec![routine(
        "f",
        vec![],
        block(
            vec![
                let_decl(
                    "p",
                    Expr::Pair {
                        first: Box::new(Expr::number(1)),
                        second: Box::new(Expr::number(2)),
                    },
                ),
                let_decl(
                    "q",
                    Expr::binary(
                        op,
                        Expr::var("p"),
                        Expr::Pair {
                            first: Box::new(Expr::number(3)),
                            second: Box::new(Expr::number(4)),
                        },
                    ),
                ),
            ],
            vec![Stmt::call("WRITEN", vec![Expr::var("q")])],
        ),
    )])
}

#[test]
fn s5_pair_addition_uses_neon_2s() {
    let mut program = pair_program(BinOp::Add);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    assert!(text.contains("fmov d"), "operands never moved to NEON:\n{text}");
    assert!(
        text.contains("add v") && text.contains(".2s"),
        "no .2s vector add:\n{text}"
    );
}

#[test]
fn s5_pair_equality_is_one_compare() {
    let mut program = pair_program(BinOp::Eq);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    assert!(text.contains("csetm"), "no materialized comparison:\n{text}");
    // Equality of packed pairs never touches the vector unit.
    assert!(!text.contains("add v"), "unexpected vector op:\n{text}");
}

#[test]
fn s5_pair_ordering_is_rejected() {
    let mut program = pair_program(BinOp::Lt);
    match compile(&mut program, &no_samm()) {
        Err(CompileError::Rejected(errors)) => {
            assert!(errors.iter().any(|e| e.message.contains("ordering")));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

// ----------------------------------------------------------------------
// S6: call-crossing variables live in callee-saved registers

#[test]
fn s6_call_crossing_variable_gets_callee_saved_home() {
    let mut program = Program::new(vec![routine(
        "f",
        vec![],
        block(
            vec![let_decl("x", Expr::number(41))],
            vec![
                Stmt::call("WRITEN", vec![Expr::var("x")]),
                Stmt::call("WRITEN", vec![Expr::var("x")]),
            ],
        ),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    // x28 is the first register popped from the callee-saved pool; the
    // prologue must save it and no spill reload may appear for x.
    assert!(
        text.contains("str x28, [sp") || text.contains("stp x27, x28"),
        "callee-saved home not preserved:\n{text}"
    );
    assert!(text.contains("bl veneer_WRITEN"));
}

#[test]
fn s6_float_parameter_moves_stay_in_the_fp_file() {
    // `a` is typed FLOAT from the arithmetic context; its home register is
    // a D register, so the prologue shuffle must be an fmov, not an
    // integer mov of the D-register number.
    let mut program = Program::new(vec![routine(
        "f",
        vec!["a"],
        block(
            vec![let_decl(
                "b",
                Expr::binary(BinOp::Add, Expr::var("a"), Expr::Float(1.5)),
            )],
            vec![
                Stmt::call("WRITEF", vec![Expr::var("b")]),
                Stmt::call("WRITEF", vec![Expr::var("b")]),
            ],
        ),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let listing = output.text_listing();
    assert!(
        listing
            .iter()
            .any(|l| l.starts_with("fmov d") && l.ends_with(", d0")),
        "float parameter was not moved with fmov: {listing:?}"
    );
    assert!(
        !listing.iter().any(|l| l.starts_with("mov ") && l.contains(", d")),
        "integer mov touched a D register: {listing:?}"
    );
}

// ----------------------------------------------------------------------
// S7: SWITCHON with MANIFEST labels

#[test]
fn s7_manifest_case_labels_compile_to_immediates() {
    let mut program = Program::new(vec![
        Decl::Manifest {
            name: "RED".into(),
            value: 5,
        },
        routine(
            "f",
            vec!["v"],
            Stmt::Switchon {
                expr: Expr::var("v"),
                cases: vec![SwitchCase {
                    value: Expr::var("RED"),
                    body: vec![Stmt::call("WRITES", vec![Expr::StringLit("red".into())]), Stmt::Endcase],
                }],
                default_body: Some(vec![Stmt::call(
                    "WRITES",
                    vec![Expr::StringLit("other".into())],
                )]),
            },
        ),
    ]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let listing = output.text_listing();
    assert!(
        listing
            .iter()
            .any(|l| l.starts_with("cmp") && l.ends_with("#5")),
        "manifest label did not fold to an immediate: {listing:?}"
    );
    assert!(listing.iter().any(|l| l.starts_with("b.eq")));
}

#[test]
fn s7_non_constant_case_label_is_rejected() {
    let mut program = Program::new(vec![routine(
        "f",
        vec!["v", "w"],
        Stmt::Switchon {
            expr: Expr::var("v"),
            cases: vec![SwitchCase {
                value: Expr::var("w"),
                body: vec![Stmt::Endcase],
            }],
            default_body: None,
        },
    )]);
    match compile(&mut program, &no_samm()) {
        Err(CompileError::Rejected(errors)) => {
            assert!(errors.iter().any(|e| e.message.contains("CASE")));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

// ----------------------------------------------------------------------
// SAMM and veneer invariants

#[test]
fn samm_build_emits_no_legacy_cleanup_calls() {
    let mut program = Program::new(vec![routine(
        "f",
        vec![],
        block(
            vec![let_decl(
                "v",
                Expr::Alloc {
                    kind: AllocKind::Vec,
                    size: Box::new(Expr::number(16)),
                },
            )],
            vec![Stmt::call("WRITEN", vec![Expr::var("v")])],
        ),
    )]);
    let output = compile(&mut program, &Flags::default()).unwrap();
    let text = compiled_text(&output);
    assert!(text.contains("veneer_HeapManager_enter_scope"));
    assert!(text.contains("veneer_HeapManager_exit_scope"));
    assert!(!text.contains("bl veneer_FREEVEC"), "legacy free under SAMM:\n{text}");
    assert!(!text.contains("BCPL_FREE_LIST"), "legacy free under SAMM:\n{text}");
}

#[test]
fn legacy_build_frees_owning_vectors() {
    let mut program = Program::new(vec![routine(
        "f",
        vec![],
        block(
            vec![let_decl(
                "v",
                Expr::Alloc {
                    kind: AllocKind::Vec,
                    size: Box::new(Expr::number(16)),
                },
            )],
            vec![Stmt::call("WRITEN", vec![Expr::var("v")])],
        ),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    assert!(text.contains("bl veneer_FREEVEC"), "no cleanup emitted:\n{text}");
    assert!(!text.contains("HeapManager_enter_scope"));
}

#[test]
fn external_calls_route_through_veneers() {
    let mut program = Program::new(vec![routine(
        "f",
        vec![],
        Stmt::call("WRITES", vec![Expr::StringLit("hello".into())]),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let listing = output.text_listing();
    // The veneer comes before the function body and the call targets it.
    let veneer_pos = listing.iter().position(|l| l == "veneer_WRITES:").unwrap();
    let func_pos = listing.iter().position(|l| l == "f:").unwrap();
    assert!(veneer_pos < func_pos);
    assert!(listing.iter().any(|l| l == "bl veneer_WRITES"));
}

#[test]
fn globals_are_addressed_off_the_data_base() {
    let mut program = Program::new(vec![
        Decl::Global {
            name: "COUNTER".into(),
            initializer: Some(Expr::number(7)),
        },
        routine(
            "bump",
            vec![],
            Stmt::assign(
                Expr::var("COUNTER"),
                Expr::binary(BinOp::Add, Expr::var("COUNTER"), Expr::number(1)),
            ),
        ),
    ]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let text = compiled_text(&output);
    assert!(
        text.contains("adrp x28, L__data_segment_base"),
        "missing data base materialization:\n{text}"
    );
    // The data section opens with the anchor and the initialized word.
    let data: Vec<String> = output.stream.listing(bcpl_codegen::stream::Segment::Data);
    assert_eq!(data[0], "L__data_segment_base:");
    assert_eq!(data[1], ".quad 0x7");
}

#[test]
fn jit_mode_uses_absolute_addressing() {
    let flags = Flags {
        jit_mode: true,
        data_segment_base_addr: 0x4000_0000,
        samm_enabled: false,
        ..Flags::default()
    };
    let mut program = Program::new(vec![
        Decl::Global {
            name: "G".into(),
            initializer: None,
        },
        routine(
            "f",
            vec![],
            Stmt::assign(Expr::var("G"), Expr::number(1)),
        ),
    ]);
    let output = compile(&mut program, &flags).unwrap();
    let text = compiled_text(&output);
    assert!(!text.contains("adrp x28"), "page-relative in JIT mode:\n{text}");
    assert!(text.contains("movz x28"), "missing absolute base load:\n{text}");
}

#[test]
fn jit_mode_without_data_base_is_rejected() {
    let flags = Flags {
        jit_mode: true,
        data_segment_base_addr: 0,
        ..Flags::default()
    };
    let mut program = Program::new(vec![routine("f", vec![], Stmt::Compound(vec![]))]);
    match compile(&mut program, &flags) {
        Err(CompileError::Structural(msg)) => assert!(msg.contains("data segment")),
        other => panic!("expected a structural error, got {other:?}"),
    }
}

#[test]
fn string_literals_are_interned_in_rodata() {
    let mut program = Program::new(vec![routine(
        "f",
        vec![],
        Stmt::Compound(vec![
            Stmt::call("WRITES", vec![Expr::StringLit("twice".into())]),
            Stmt::call("WRITES", vec![Expr::StringLit("twice".into())]),
        ]),
    )]);
    let output = compile(&mut program, &no_samm()).unwrap();
    let rodata = output.stream.listing(bcpl_codegen::stream::Segment::RoData);
    let label_count = rodata.iter().filter(|l| l.starts_with("L_str")).count();
    assert_eq!(label_count, 1, "duplicate string literal emitted: {rodata:?}");
    // UTF-32 length word precedes the code points.
    assert!(rodata.iter().any(|l| l == ".quad 0x5"));
}

#[test]
fn vtable_layout_has_create_and_release_slots() {
    let mut program = Program::new(vec![Decl::Class(ClassDecl {
        name: "Shape".into(),
        parent_class_name: String::new(),
        members: vec![member(Decl::Function(FunctionDecl {
            name: "area".into(),
            parameters: vec![],
            body: Expr::Valof(Box::new(Stmt::Resultis(Expr::number(0)))),
            is_float_function: false,
            is_virtual: true,
            is_final: false,
        }))],
    })]);
    let output = compile(&mut program, &Flags::default()).unwrap();
    let vtable = output.stream.listing_after_label("Shape_vtable");
    assert_eq!(vtable[0], ".quad Shape::CREATE");
    assert_eq!(vtable[1], ".quad Shape::RELEASE");
    assert_eq!(vtable[2], ".quad Shape::area");
}

#[test]
fn virtual_dispatch_loads_vtable_and_slot() {
    let mut program = Program::new(vec![
        Decl::Class(ClassDecl {
            name: "Shape".into(),
            parent_class_name: String::new(),
            members: vec![member(Decl::Function(FunctionDecl {
                name: "area".into(),
                parameters: vec![],
                body: Expr::Valof(Box::new(Stmt::Resultis(Expr::number(9)))),
                is_float_function: false,
                is_virtual: true,
                is_final: false,
            }))],
        }),
        routine(
            "f",
            vec![],
            block(
                vec![let_decl(
                    "s",
                    Expr::New {
                        class_name: "Shape".into(),
                        args: vec![],
                    },
                )],
                vec![Stmt::call(
                    "WRITEN",
                    vec![Expr::Call {
                        func: Box::new(Expr::member(Expr::var("s"), "area")),
                        args: vec![],
                    }],
                )],
            ),
        ),
    ]);
    let output = compile(&mut program, &Flags::default()).unwrap();
    let text = compiled_text(&output);
    assert!(text.contains("bl veneer_OBJECT_HEAP_ALLOC"));
    // The method address loads from slot 2 (after CREATE and RELEASE).
    assert!(text.contains("#16"), "slot-2 load missing:\n{text}");
    assert!(text.contains("blr"));
}
