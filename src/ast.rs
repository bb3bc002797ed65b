//! The input AST.
//!
//! The tree below is the sole structured input to the compiler: the parser
//! (out of scope here) produces one `Program` per compilation unit. Nodes are
//! plain tagged unions; every pass dispatches with `match` rather than a
//! visitor object, and cross-references between passes are by name (function
//! names, mangled method names, class names), never by pointer.
//!
//! A handful of statement kinds are never produced by a parser: the CFG
//! builder synthesizes `ConditionalBranch`, `ReductionLoop` and
//! `PairwiseReductionLoop` nodes while lowering loops, and the class pass
//! synthesizes `CREATE`/`RELEASE` bodies. They live in the same enum so the
//! code generator consumes one statement type.

/// Member visibility inside a class declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit logical AND; compiles to branches, never to a bitwise op.
    LogAnd,
    /// Short-circuit logical OR.
    LogOr,
    BitAnd,
    BitOr,
    Xor,
    Lsl,
    Lsr,
}

impl BinOp {
    /// True for the six relational operators, which always produce a boolean
    /// word (0 or -1) regardless of operand type.
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    /// True for `<`, `<=`, `>`, `>=`; these are rejected on packed operands.
    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    LogNot,
    BitNot,
    /// `@e` — address of.
    AddrOf,
    /// `!e` — word indirection.
    Deref,
    /// `HD e` — head of a list.
    Head,
    /// `TL e` — destructive tail (consumes the head node).
    Tail,
    /// `TL! e` — non-destructive rest.
    Rest,
    /// `LEN e` — element count of a vec/string/list/table.
    Length,
    /// `FLOAT e` — integer to float conversion.
    IntToFloat,
    /// `FIX e` — float to integer truncation.
    FloatToInt,
    /// `TYPE e` — statically folded to a string literal naming the type.
    TypeOf,
}

/// Heap allocation primitives that appear in expression position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    /// `VEC n` — vector of n words.
    Vec,
    /// `FVEC n` — vector of n floats.
    FVec,
    /// `PAIRS n` — vector of n packed integer pairs.
    Pairs,
    /// `FPAIRS n` — vector of n packed float pairs.
    FPairs,
    /// `STRING n` — string buffer of n code points.
    Str,
}

/// Reduction operators shared by the scalar and NEON lowering paths. The
/// discriminants are the `op_code` carried by `ReductionLoop` statements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReductionOp {
    Min = 0,
    Max = 1,
    Sum = 2,
}

impl ReductionOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Sum => "SUM",
        }
    }
}

/// Expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(i64),
    Float(f64),
    StringLit(String),
    CharLit(char),
    Boolean(bool),
    Variable(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `obj.member`
    MemberAccess {
        object: Box<Expr>,
        member: String,
    },
    /// `SUPER.method(args)` — valid only inside a method of a derived class.
    SuperMethodCall {
        member: String,
        args: Vec<Expr>,
    },
    /// `v!i` — word element access.
    VectorAccess {
        vector: Box<Expr>,
        index: Box<Expr>,
    },
    /// `s%i` — code point access into a string.
    CharIndirection {
        string: Box<Expr>,
        index: Box<Expr>,
    },
    /// `v.!i` — float element access.
    FloatVectorIndirection {
        vector: Box<Expr>,
        index: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `VALOF block` — value established by an inner `RESULTIS`.
    Valof(Box<Stmt>),
    /// `FLOATVALOF block` — as `VALOF`, but the result type is forced FLOAT.
    FloatValof(Box<Stmt>),
    Alloc {
        kind: AllocKind,
        size: Box<Expr>,
    },
    /// `TABLE e, ...` / `FTABLE e, ...` — read-only array literal.
    Table {
        entries: Vec<Expr>,
        is_float: bool,
    },
    /// `LIST(...)` / `MANIFESTLIST(...)` literal.
    List {
        items: Vec<Expr>,
        is_const: bool,
    },
    /// `PAIR(a, b)` — two i32 lanes packed into one word.
    Pair {
        first: Box<Expr>,
        second: Box<Expr>,
    },
    /// `FPAIR(a, b)` — two f32 lanes packed into one word.
    FPair {
        first: Box<Expr>,
        second: Box<Expr>,
    },
    /// `QUAD(a, b, c, d)` — four i32 lanes in a 128-bit value.
    Quad {
        elements: Vec<Expr>,
    },
    /// `FQUAD(a, b, c, d)` — four f32 lanes in a 128-bit value.
    FQuad {
        elements: Vec<Expr>,
    },
    /// `NEW C(args...)`
    New {
        class_name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn number(n: i64) -> Self {
        Self::Number(n)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Self {
        Self::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Call {
            func: Box::new(Self::var(name)),
            args,
        }
    }

    pub fn member(object: Expr, member: impl Into<String>) -> Self {
        Self::MemberAccess {
            object: Box::new(object),
            member: member.into(),
        }
    }

    /// The callee name, when this is a direct call through a plain name.
    pub fn direct_callee(&self) -> Option<&str> {
        match self {
            Self::Call { func, .. } => match func.as_ref() {
                Self::Variable(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }
}

/// How a `REPEAT` loop decides to continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatKind {
    /// `body REPEAT` — loop forever; exits only via BREAK/RETURN/GOTO.
    Forever,
    /// `body REPEATWHILE cond`
    While,
    /// `body REPEATUNTIL cond`
    Until,
}

/// One arm of a `SWITCHON`.
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    /// Must fold to a compile-time integer constant.
    pub value: Expr,
    pub body: Vec<Stmt>,
}

/// `FOR` loop. The unique loop variable name is assigned by the parser's
/// renaming step so nested loops over the same source name do not collide;
/// the constant-end metadata is filled in by the CFG builder when it clones
/// this node into the loop header block.
#[derive(Clone, Debug, PartialEq)]
pub struct ForStmt {
    pub loop_variable: String,
    pub unique_loop_variable_name: String,
    pub start: Expr,
    pub end: Expr,
    pub step: Option<Expr>,
    pub body: Box<Stmt>,
    pub is_end_expr_constant: bool,
    pub constant_end_value: i64,
}

/// `FOREACH v IN collection` / destructuring `FOREACH (x, y) IN pairs`.
#[derive(Clone, Debug, PartialEq)]
pub struct ForEachStmt {
    /// One name, or two for the destructuring form.
    pub vars: Vec<String>,
    pub collection: Expr,
    pub body: Box<Stmt>,
}

/// Elementwise reduction statement: `result := MIN(left, right)` over two
/// PAIRS vectors of equal length.
#[derive(Clone, Debug, PartialEq)]
pub struct ReductionStmt {
    pub op: ReductionOp,
    pub left: Expr,
    pub right: Expr,
    pub result: String,
}

/// Pairwise reduction statement: `result := PAIRWISE_MIN(input)` halving a
/// packed vector with the matching NEON horizontal op.
#[derive(Clone, Debug, PartialEq)]
pub struct PairwiseReductionStmt {
    pub op: ReductionOp,
    pub input: Expr,
    pub result: String,
}

/// Synthesized body of one lowered reduction loop iteration. Carries the
/// names of the temporaries the CFG builder registered, so the code generator
/// can find their allocated homes.
#[derive(Clone, Debug, PartialEq)]
pub struct ReductionLoopStmt {
    pub left_name: String,
    pub right_name: String,
    pub result_name: String,
    pub index_name: String,
    pub chunk_count_name: String,
    pub op: ReductionOp,
}

/// Synthesized body of one NEON pairwise-reduction iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct PairwiseReductionLoopStmt {
    pub vector_name: String,
    pub result_name: String,
    pub index_name: String,
    /// The NEON op family, e.g. `vld2_deinterleave_MIN`.
    pub intrinsic_name: String,
    /// Vector arrangement, `.2s` or `.4s`.
    pub arrangement: String,
    pub op: ReductionOp,
}

/// Statements.
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Parallel assignment; `lhs` and `rhs` have equal length.
    Assignment {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
    },
    RoutineCall {
        routine: Expr,
        args: Vec<Expr>,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
    },
    Unless {
        condition: Expr,
        body: Box<Stmt>,
    },
    Test {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Until {
        condition: Expr,
        body: Box<Stmt>,
    },
    Repeat {
        body: Box<Stmt>,
        kind: RepeatKind,
        condition: Option<Expr>,
    },
    For(ForStmt),
    ForEach(ForEachStmt),
    Switchon {
        expr: Expr,
        cases: Vec<SwitchCase>,
        default_body: Option<Vec<Stmt>>,
    },
    Goto {
        target: Expr,
    },
    Break,
    Loop,
    Finish,
    Endcase,
    Return,
    Resultis(Expr),
    /// Brace group without its own scope.
    Compound(Vec<Stmt>),
    /// `$( ... $)` block opening a new symbol scope.
    Block {
        declarations: Vec<Decl>,
        statements: Vec<Stmt>,
    },
    /// `DEFER stmt` — executed in LIFO order on function exit.
    Defer(Box<Stmt>),
    /// A named `GOTO` target.
    LabelTarget(String),
    /// `FREEVEC e` — explicit release of a heap vector.
    Free(Expr),
    /// `RETAIN v, ...` — the named locals are no longer cleaned automatically.
    Retain {
        names: Vec<String>,
    },
    /// `REMANAGE v, ...` — re-adopt the named locals for automatic cleanup.
    Remanage {
        names: Vec<String>,
    },
    Reduction(ReductionStmt),
    PairwiseReduction(PairwiseReductionStmt),

    // Synthesized by the CFG builder; never produced by a parser.
    /// Bare condition carried by a loop-header block; the block epilogue
    /// consumes it to emit the conditional branch.
    ConditionalBranch {
        condition: Expr,
        /// Branch to the first successor when the condition is *false*.
        /// Used by REPEAT..UNTIL headers, whose edge order is [exit, back].
        branch_on_false: bool,
    },
    ReductionLoop(ReductionLoopStmt),
    PairwiseReductionLoop(PairwiseReductionLoopStmt),
}

impl Stmt {
    pub fn assign(lhs: Expr, rhs: Expr) -> Self {
        Self::Assignment {
            lhs: vec![lhs],
            rhs: vec![rhs],
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::RoutineCall {
            routine: Expr::var(name),
            args,
        }
    }

    /// True if this statement unconditionally transfers control and therefore
    /// must be the last statement of its basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Goto { .. }
                | Self::Break
                | Self::Loop
                | Self::Finish
                | Self::Endcase
                | Self::Return
                | Self::Resultis(_)
        )
    }
}

/// `LET` / `FLET` declaration, at top level (globals) or inside a block.
#[derive(Clone, Debug, PartialEq)]
pub struct LetDecl {
    pub names: Vec<String>,
    /// Parallel to `names`; `None` means declared without an initializer.
    pub initializers: Vec<Option<Expr>>,
    pub is_float: bool,
}

/// Function declaration: a parameterized expression body (usually `VALOF`).
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Expr,
    pub is_float_function: bool,
    pub is_virtual: bool,
    pub is_final: bool,
}

/// Routine declaration: a parameterized statement body with no result.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutineDecl {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Stmt,
    pub is_virtual: bool,
    pub is_final: bool,
}

/// One member of a class declaration with its visibility.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassMember {
    pub declaration: Decl,
    pub visibility: Visibility,
}

/// Class declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    /// Empty string when the class has no parent.
    pub parent_class_name: String,
    pub members: Vec<ClassMember>,
}

/// Top-level and block-level declarations.
#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    Let(LetDecl),
    Function(FunctionDecl),
    Routine(RoutineDecl),
    Class(ClassDecl),
    /// Compile-time integer constant.
    Manifest {
        name: String,
        value: i64,
    },
    /// One word in the writable data segment.
    Global {
        name: String,
        initializer: Option<Expr>,
    },
    Static {
        name: String,
        initializer: Option<Expr>,
    },
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Self::Let(l) => l.names.first().map(String::as_str).unwrap_or(""),
            Self::Function(f) => &f.name,
            Self::Routine(r) => &r.name,
            Self::Class(c) => &c.name,
            Self::Manifest { name, .. } | Self::Global { name, .. } | Self::Static { name, .. } => {
                name
            }
        }
    }
}

/// A whole compilation unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub declarations: Vec<Decl>,
}

impl Program {
    pub fn new(declarations: Vec<Decl>) -> Self {
        Self { declarations }
    }
}
