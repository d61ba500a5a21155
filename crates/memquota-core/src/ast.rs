//! Editable program representation.
//!
//! A `Program` is a list of class declarations. A class flagged `script` owns
//! the entry routine (`run`, no parameters) that starts execution; other
//! methods of the script class are the script's top-level functions.
//!
//! Every node is serde-serializable so programs can be loaded from YAML and
//! hashed deterministically. The planner mutates this tree in place through
//! `visit::VisitMut`; the exec crate walks it to run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::QuotaConfig;

/// A compiled unit: every class the front end produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub classes: Vec<ClassDecl>,
}

impl Program {
    pub fn new(classes: Vec<ClassDecl>) -> Self {
        Self { classes }
    }

    /// First class flagged as a script, if any.
    pub fn script_class(&self) -> Option<&ClassDecl> {
        self.classes.iter().find(|c| c.script)
    }

    pub fn class(&self, name: &str) -> Option<&ClassDecl> {
        self.classes.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    #[serde(default)]
    pub script: bool,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub properties: Vec<FieldDecl>,
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
}

impl ClassDecl {
    pub fn script(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: true,
            ..Default::default()
        }
    }

    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDecl> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Annotation usage. Members are kept as raw expressions; nothing evaluates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    #[serde(default)]
    pub members: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default, rename = "synthetic")]
    pub is_synthetic: bool,
}

/// Field or property declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(default)]
    pub init: Option<Expr>,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, init: Option<Expr>) -> Self {
        Self {
            name: name.into(),
            init,
            modifiers: Modifiers::default(),
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    /// `None` for abstract/bodiless routines.
    #[serde(default)]
    pub body: Option<Block>,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl MethodDecl {
    pub fn new(name: impl Into<String>, params: Vec<String>, body: Block) -> Self {
        Self {
            name: name.into(),
            params,
            body: Some(body),
            modifiers: Modifiers::default(),
            annotations: Vec::new(),
        }
    }

    pub fn abstract_method(name: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            name: name.into(),
            params,
            body: None,
            modifiers: Modifiers {
                is_abstract: true,
                ..Modifiers::default()
            },
            annotations: Vec::new(),
        }
    }

    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }
}

/// Ordered statement list. Serialized as a plain sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Insert `stmt` so it runs before everything already in the block.
    pub fn prepend(&mut self, stmt: Stmt) {
        self.stmts.insert(0, stmt);
    }
}

/// The three looping statement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    For,
    While,
    DoWhile,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopKind::For => "for",
            LoopKind::While => "while",
            LoopKind::DoWhile => "do_while",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Expr(Expr),
    /// Declare a variable in the current scope.
    Let {
        name: String,
        #[serde(default)]
        init: Option<Expr>,
    },
    /// Assign to the nearest enclosing binding, or create a script binding.
    Assign {
        name: String,
        value: Expr,
    },
    IndexAssign {
        target: Expr,
        index: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Block,
        #[serde(default)]
        otherwise: Option<Block>,
    },
    /// Count-controlled loop: `for (init; cond; update) body`.
    For {
        #[serde(default)]
        init: Option<Box<Stmt>>,
        #[serde(default)]
        cond: Option<Expr>,
        #[serde(default)]
        update: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    /// Pre-test loop.
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    /// Post-test loop.
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Throw(Expr),
    Block(Block),
    /// Construct, configure and `init()` the execution's quota watchdog.
    QuotaInit(QuotaConfig),
    /// Run one quota check against the execution's watchdog.
    QuotaCheck,
}

impl Stmt {
    pub fn expr(e: Expr) -> Self {
        Stmt::Expr(e)
    }

    pub fn let_(name: impl Into<String>, init: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            init: Some(init),
        }
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            name: name.into(),
            value,
        }
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Stmt::Block(Block::new(stmts))
    }

    /// `for (var = from; var < to; var += 1) body`
    pub fn counted_for(var: &str, from: i64, to: i64, body: Vec<Stmt>) -> Self {
        Stmt::For {
            init: Some(Box::new(Stmt::let_(var, Expr::Int(from)))),
            cond: Some(Expr::binary(BinaryOp::Lt, Expr::var(var), Expr::Int(to))),
            update: Some(Box::new(Stmt::assign(
                var,
                Expr::binary(BinaryOp::Add, Expr::var(var), Expr::Int(1)),
            ))),
            body: Box::new(Stmt::block(body)),
        }
    }

    /// Loop kind and body of a looping statement.
    pub fn loop_body_mut(&mut self) -> Option<(LoopKind, &mut Box<Stmt>)> {
        match self {
            Stmt::For { body, .. } => Some((LoopKind::For, body)),
            Stmt::While { body, .. } => Some((LoopKind::While, body)),
            Stmt::DoWhile { body, .. } => Some((LoopKind::DoWhile, body)),
            _ => None,
        }
    }

    pub fn is_quota_check(&self) -> bool {
        matches!(self, Stmt::QuotaCheck)
    }
}

/// Replace `slot` with `{ added; <old slot> }`.
pub fn wrap_stmt(slot: &mut Box<Stmt>, added: Stmt) {
    let wrapped = std::mem::replace(slot.as_mut(), Stmt::Block(Block::default()));
    **slot = Stmt::Block(Block::new(vec![added, wrapped]));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
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
    And,
    Or,
}

/// Anonymous function literal. The body is shared with every closure value
/// created from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    #[serde(default)]
    pub params: Vec<String>,
    pub body: Arc<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// `nil` in YAML; a bare `null` would not select a variant.
    #[serde(rename = "nil")]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Var(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Named method call. `target` names a class; `None` means the class the
    /// caller belongs to.
    Call {
        #[serde(default)]
        target: Option<String>,
        method: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Invoke a closure value.
    CallValue {
        callee: Box<Expr>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Closure(Closure),
    /// Allocate a zeroed byte array of the given length.
    NewBytes(Box<Expr>),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Len(Box<Expr>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Expr::Str(s.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: None,
            method: method.into(),
            args,
        }
    }

    pub fn call_on(target: impl Into<String>, method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: Some(target.into()),
            method: method.into(),
            args,
        }
    }

    pub fn call_value(callee: Expr, args: Vec<Expr>) -> Self {
        Expr::CallValue {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn closure(params: Vec<String>, body: Vec<Stmt>) -> Self {
        Expr::Closure(Closure {
            params,
            body: Arc::new(Block::new(body)),
        })
    }

    pub fn new_bytes(len: Expr) -> Self {
        Expr::NewBytes(Box::new(len))
    }
}
