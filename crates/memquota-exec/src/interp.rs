//! Tree-walking interpreter for (instrumented) programs.
//!
//! Scoping: the script binding is the root scope. Method calls get a fresh
//! child of it; blocks and loops nest further. Closures capture the scope
//! they were created in. Assigning to a name with no binding anywhere
//! creates it in the script binding.
//!
//! `QuotaInit` and `QuotaCheck` drive the run's single `QuotaWatchdog`. Only
//! the first `QuotaInit` of a run takes effect, so re-entering the entry
//! routine cannot move the baseline.
//!
//! Two limits bound native recursion: `max_depth` counts active method and
//! closure calls, `max_nesting` counts every nested statement and expression
//! evaluation across all of them.

use std::sync::Arc;

use memquota_core::ast::{BinaryOp, Block, ClassDecl, Expr, Program, Stmt, UnaryOp};
use memquota_core::config::QuotaConfig;
use memquota_core::counter::AllocationCounter;
use memquota_core::manifest::QuotaSnapshot;
use memquota_mem::{HandlerResolver, QuotaWatchdog};

use crate::runtime::ExecError;
use crate::value::{lock, ClosureValue, Env, Scope, Value};

type Result<T> = std::result::Result<T, ExecError>;

/// How a statement finished.
enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

pub struct Interpreter<'p> {
    program: &'p Program,
    counter: Arc<dyn AllocationCounter>,
    resolver: &'p dyn HandlerResolver,
    watchdog: Option<QuotaWatchdog>,
    globals: Env,
    depth: usize,
    max_depth: usize,
    nesting: usize,
    max_nesting: usize,
}

impl<'p> Interpreter<'p> {
    pub const DEFAULT_MAX_DEPTH: usize = 128;
    pub const DEFAULT_MAX_NESTING: usize = 4096;

    pub fn new(
        program: &'p Program,
        counter: Arc<dyn AllocationCounter>,
        resolver: &'p dyn HandlerResolver,
    ) -> Self {
        Self {
            program,
            counter,
            resolver,
            watchdog: None,
            globals: Scope::root(),
            depth: 0,
            max_depth: Self::DEFAULT_MAX_DEPTH,
            nesting: 0,
            max_nesting: Self::DEFAULT_MAX_NESTING,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_nesting(mut self, max_nesting: usize) -> Self {
        self.max_nesting = max_nesting;
        self
    }

    pub fn watchdog(&self) -> Option<&QuotaWatchdog> {
        self.watchdog.as_ref()
    }

    pub fn quota_snapshot(&self) -> Option<QuotaSnapshot> {
        self.watchdog.as_ref().map(QuotaWatchdog::snapshot)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        Scope::lookup(&self.globals, name)
    }

    /// Evaluate `class`'s field and property initialisers into the script
    /// binding, then call `method` with no arguments.
    pub fn run_entry(&mut self, class: &str, method: &str) -> Result<Value> {
        let program = self.program;
        let decl = program.class(class).ok_or_else(|| ExecError::NoMethod {
            class: class.to_string(),
            method: method.to_string(),
            arity: 0,
        })?;

        let globals = Arc::clone(&self.globals);
        for field in decl.fields.iter().chain(&decl.properties) {
            let value = match &field.init {
                Some(e) => self.eval(e, &globals, &decl.name)?,
                None => Value::Null,
            };
            lock(&globals).define(field.name.clone(), value);
        }

        self.call_method(decl, method, Vec::new())
    }

    fn call_method(&mut self, class: &ClassDecl, name: &str, args: Vec<Value>) -> Result<Value> {
        let method = class
            .methods
            .iter()
            .find(|m| m.name == name && m.params.len() == args.len())
            .ok_or_else(|| ExecError::NoMethod {
                class: class.name.clone(),
                method: name.to_string(),
                arity: args.len(),
            })?;
        let body = method.body.as_ref().ok_or_else(|| {
            ExecError::Type(format!("cannot call abstract method '{}::{}'", class.name, name))
        })?;

        let env = Scope::child(&self.globals);
        for (param, arg) in method.params.iter().zip(args) {
            lock(&env).define(param.clone(), arg);
        }
        self.invoke(body, &env, &class.name)
    }

    fn call_closure(&mut self, closure: Arc<ClosureValue>, args: Vec<Value>) -> Result<Value> {
        if closure.params.len() != args.len() {
            return Err(ExecError::Type(format!(
                "closure takes {} argument(s), got {}",
                closure.params.len(),
                args.len()
            )));
        }
        let env = Scope::child(&closure.env);
        for (param, arg) in closure.params.iter().zip(args) {
            lock(&env).define(param.clone(), arg);
        }
        self.invoke(&closure.body, &env, &closure.class)
    }

    fn invoke(&mut self, body: &Block, env: &Env, class: &str) -> Result<Value> {
        if self.depth >= self.max_depth {
            return Err(ExecError::StackOverflow(self.max_depth));
        }
        self.depth += 1;
        let flow = self.exec_stmts(&body.stmts, env, class);
        self.depth -= 1;

        match flow? {
            Flow::Normal => Ok(Value::Null),
            Flow::Return(v) => Ok(v),
            Flow::Break => Err(ExecError::StrayJump("break")),
            Flow::Continue => Err(ExecError::StrayJump("continue")),
        }
    }

    fn exec_stmts(&mut self, stmts: &[Stmt], env: &Env, class: &str) -> Result<Flow> {
        for stmt in stmts {
            match self.exec(stmt, env, class)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, block: &Block, env: &Env, class: &str) -> Result<Flow> {
        let scope = Scope::child(env);
        self.exec_stmts(&block.stmts, &scope, class)
    }

    fn nest(&mut self) -> Result<()> {
        if self.nesting >= self.max_nesting {
            return Err(ExecError::NestingTooDeep(self.max_nesting));
        }
        self.nesting += 1;
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, env: &Env, class: &str) -> Result<Flow> {
        self.nest()?;
        let flow = self.exec_inner(stmt, env, class);
        self.nesting -= 1;
        flow
    }

    fn exec_inner(&mut self, stmt: &Stmt, env: &Env, class: &str) -> Result<Flow> {
        match stmt {
            Stmt::Expr(e) => {
                self.eval(e, env, class)?;
            }
            Stmt::Let { name, init } => {
                let value = match init {
                    Some(e) => self.eval(e, env, class)?,
                    None => Value::Null,
                };
                lock(env).define(name.clone(), value);
            }
            Stmt::Assign { name, value } => {
                let value = self.eval(value, env, class)?;
                if let Err(value) = Scope::assign(env, name, value) {
                    lock(&self.globals).define(name.clone(), value);
                }
            }
            Stmt::IndexAssign {
                target,
                index,
                value,
            } => {
                let target = self.eval(target, env, class)?;
                let index = self.eval_int(index, env, class)?;
                let value = self.eval_int(value, env, class)?;
                let bytes = match &target {
                    Value::Bytes(bytes) => Arc::clone(bytes),
                    other => return Err(type_error("index assignment", other)),
                };
                let mut buf = lock(&bytes);
                let len = buf.len();
                let slot = checked_index(index, len).and_then(|i| buf.get_mut(i));
                match slot {
                    // Narrowing store, like a byte cast.
                    Some(slot) => *slot = value as u8,
                    None => return Err(ExecError::OutOfBounds { index, len }),
                }
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, env, class)?.truthy() {
                    return self.exec_block(then, env, class);
                } else if let Some(b) = otherwise {
                    return self.exec_block(b, env, class);
                }
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                let scope = Scope::child(env);
                if let Some(init) = init {
                    self.exec(init, &scope, class)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !self.eval(cond, &scope, class)?.truthy() {
                            break;
                        }
                    }
                    match self.exec(body, &scope, class)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.exec(update, &scope, class)?;
                    }
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, env, class)?.truthy() {
                    match self.exec(body, env, class)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            Stmt::DoWhile { body, cond } => loop {
                match self.exec(body, env, class)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
                if !self.eval(cond, env, class)?.truthy() {
                    break;
                }
            },
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return(e) => {
                let value = match e {
                    Some(e) => self.eval(e, env, class)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(e) => {
                let value = self.eval(e, env, class)?;
                return Err(ExecError::Thrown(value.to_string()));
            }
            Stmt::Block(b) => return self.exec_block(b, env, class),
            Stmt::QuotaInit(quota) => self.init_watchdog(quota)?,
            Stmt::QuotaCheck => {
                self.watchdog
                    .as_mut()
                    .ok_or(memquota_mem::Error::InvalidState)?
                    .check()?;
            }
        }
        Ok(Flow::Normal)
    }

    fn init_watchdog(&mut self, quota: &QuotaConfig) -> Result<()> {
        if self.watchdog.is_some() {
            return Ok(());
        }
        let mut watchdog = QuotaWatchdog::new(Arc::clone(&self.counter));
        watchdog.set_limit(quota.limit_bytes)?;
        watchdog.set_handler_from(self.resolver, &quota.handler_type, &quota.handler_method)?;
        watchdog.init()?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            thread = %watchdog.thread_id(),
            base_usage = watchdog.base_usage(),
            limit = watchdog.limit(),
            "quota watchdog initialized"
        );

        self.watchdog = Some(watchdog);
        Ok(())
    }

    fn eval_int(&mut self, e: &Expr, env: &Env, class: &str) -> Result<i64> {
        let v = self.eval(e, env, class)?;
        v.as_int().ok_or_else(|| type_error("integer operand", &v))
    }

    fn eval_args(&mut self, args: &[Expr], env: &Env, class: &str) -> Result<Vec<Value>> {
        args.iter().map(|a| self.eval(a, env, class)).collect()
    }

    fn eval(&mut self, e: &Expr, env: &Env, class: &str) -> Result<Value> {
        self.nest()?;
        let value = self.eval_inner(e, env, class);
        self.nesting -= 1;
        value
    }

    fn eval_inner(&mut self, e: &Expr, env: &Env, class: &str) -> Result<Value> {
        Ok(match e {
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Int(i) => Value::Int(*i),
            Expr::Str(s) => Value::from(s.as_str()),
            Expr::Var(name) => {
                Scope::lookup(env, name).ok_or_else(|| ExecError::Undefined(name.clone()))?
            }
            Expr::Unary { op, expr } => {
                let v = self.eval(expr, env, class)?;
                match op {
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                    UnaryOp::Neg => {
                        let i = v.as_int().ok_or_else(|| type_error("negation", &v))?;
                        Value::Int(i.checked_neg().ok_or_else(overflow)?)
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::And => {
                    let l = self.eval(lhs, env, class)?.truthy();
                    Value::Bool(l && self.eval(rhs, env, class)?.truthy())
                }
                BinaryOp::Or => {
                    let l = self.eval(lhs, env, class)?.truthy();
                    Value::Bool(l || self.eval(rhs, env, class)?.truthy())
                }
                _ => {
                    let l = self.eval(lhs, env, class)?;
                    let r = self.eval(rhs, env, class)?;
                    binary(*op, l, r)?
                }
            },
            Expr::Call {
                target,
                method,
                args,
            } => {
                let args = self.eval_args(args, env, class)?;
                let class_name = target.as_deref().unwrap_or(class);
                let program = self.program;
                let decl = program
                    .class(class_name)
                    .ok_or_else(|| ExecError::NoMethod {
                        class: class_name.to_string(),
                        method: method.clone(),
                        arity: args.len(),
                    })?;
                self.call_method(decl, method, args)?
            }
            Expr::CallValue { callee, args } => {
                let callee = self.eval(callee, env, class)?;
                let closure = match callee {
                    Value::Closure(closure) => closure,
                    other => return Err(type_error("call", &other)),
                };
                let args = self.eval_args(args, env, class)?;
                self.call_closure(closure, args)?
            }
            Expr::Closure(c) => Value::Closure(Arc::new(ClosureValue {
                params: c.params.clone(),
                body: Arc::clone(&c.body),
                env: Arc::clone(env),
                class: class.to_string(),
            })),
            Expr::NewBytes(len) => {
                let n = self.eval_int(len, env, class)?;
                let n = usize::try_from(n)
                    .map_err(|_| ExecError::Arithmetic(format!("negative array size {n}")))?;
                Value::bytes(n)
            }
            Expr::Index { target, index } => {
                let target = self.eval(target, env, class)?;
                let index = self.eval_int(index, env, class)?;
                let Value::Bytes(buf) = &target else {
                    return Err(type_error("indexing", &target));
                };
                let buf = lock(buf);
                let len = buf.len();
                match checked_index(index, len).and_then(|i| buf.get(i)) {
                    Some(b) => Value::Int(i64::from(*b)),
                    None => return Err(ExecError::OutOfBounds { index, len }),
                }
            }
            Expr::Len(e) => match self.eval(e, env, class)? {
                Value::Bytes(buf) => Value::Int(lock(&buf).len() as i64),
                Value::Str(s) => Value::Int(s.chars().count() as i64),
                other => return Err(type_error("len", &other)),
            },
        })
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    use BinaryOp::*;

    Ok(match (op, &l, &r) {
        (Eq, _, _) => Value::Bool(l == r),
        (Ne, _, _) => Value::Bool(l != r),
        (Add, Value::Str(_), _) | (Add, _, Value::Str(_)) => {
            Value::from(format!("{l}{r}").as_str())
        }
        (Add, Value::Int(a), Value::Int(b)) => Value::Int(a.checked_add(*b).ok_or_else(overflow)?),
        (Sub, Value::Int(a), Value::Int(b)) => Value::Int(a.checked_sub(*b).ok_or_else(overflow)?),
        (Mul, Value::Int(a), Value::Int(b)) => Value::Int(a.checked_mul(*b).ok_or_else(overflow)?),
        (Div | Rem, Value::Int(_), Value::Int(0)) => {
            return Err(ExecError::Arithmetic("division by zero".into()))
        }
        (Div, Value::Int(a), Value::Int(b)) => Value::Int(a.checked_div(*b).ok_or_else(overflow)?),
        (Rem, Value::Int(a), Value::Int(b)) => Value::Int(a.checked_rem(*b).ok_or_else(overflow)?),
        (Lt, Value::Int(a), Value::Int(b)) => Value::Bool(a < b),
        (Le, Value::Int(a), Value::Int(b)) => Value::Bool(a <= b),
        (Gt, Value::Int(a), Value::Int(b)) => Value::Bool(a > b),
        (Ge, Value::Int(a), Value::Int(b)) => Value::Bool(a >= b),
        (Lt, Value::Str(a), Value::Str(b)) => Value::Bool(a < b),
        (Le, Value::Str(a), Value::Str(b)) => Value::Bool(a <= b),
        (Gt, Value::Str(a), Value::Str(b)) => Value::Bool(a > b),
        (Ge, Value::Str(a), Value::Str(b)) => Value::Bool(a >= b),
        _ => {
            return Err(ExecError::Type(format!(
                "unsupported operands for {op:?}: {} and {}",
                l.type_name(),
                r.type_name()
            )))
        }
    })
}

fn checked_index(index: i64, len: usize) -> Option<usize> {
    usize::try_from(index).ok().filter(|i| *i < len)
}

fn overflow() -> ExecError {
    ExecError::Arithmetic("integer overflow".into())
}

fn type_error(what: &str, v: &Value) -> ExecError {
    ExecError::Type(format!("{what} not supported on {}", v.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memquota_core::ast::{FieldDecl, MethodDecl};
    use memquota_core::id::ThreadId;
    use memquota_mem::{Error, HandlerError, ManualCounter};

    use crate::handlers::{HandlerRegistry, Visibility};

    fn script(run_body: Vec<Stmt>, extra: Vec<MethodDecl>) -> Program {
        let mut class = ClassDecl::script("Script")
            .with_method(MethodDecl::new("run", vec![], Block::new(run_body)));
        class.methods.extend(extra);
        Program::new(vec![class])
    }

    fn run(program: &Program) -> Result<Value> {
        let registry = HandlerRegistry::builtin();
        let mut interp = Interpreter::new(program, Arc::new(ManualCounter::new()), &registry);
        interp.run_entry("Script", "run")
    }

    fn var(n: &str) -> Expr {
        Expr::var(n)
    }

    fn bin(op: BinaryOp, l: Expr, r: Expr) -> Expr {
        Expr::binary(op, l, r)
    }

    #[test]
    fn method_calls_and_recursion() {
        // fact(n) = n <= 1 ? 1 : n * fact(n - 1)
        let fact = MethodDecl::new(
            "fact",
            vec!["n".into()],
            Block::new(vec![
                Stmt::If {
                    cond: bin(BinaryOp::Le, var("n"), Expr::Int(1)),
                    then: Block::new(vec![Stmt::Return(Some(Expr::Int(1)))]),
                    otherwise: None,
                },
                Stmt::Return(Some(bin(
                    BinaryOp::Mul,
                    var("n"),
                    Expr::call("fact", vec![bin(BinaryOp::Sub, var("n"), Expr::Int(1))]),
                ))),
            ]),
        );
        let p = script(
            vec![Stmt::Return(Some(Expr::call("fact", vec![Expr::Int(10)])))],
            vec![fact],
        );
        assert_eq!(run(&p).expect("run"), Value::Int(3_628_800));
    }

    #[test]
    fn closures_capture_their_scope() {
        let p = script(
            vec![
                Stmt::let_("count", Expr::Int(0)),
                Stmt::let_(
                    "bump",
                    Expr::closure(
                        vec!["by".into()],
                        vec![Stmt::assign(
                            "count",
                            bin(BinaryOp::Add, var("count"), var("by")),
                        )],
                    ),
                ),
                Stmt::expr(Expr::call_value(var("bump"), vec![Expr::Int(2)])),
                Stmt::expr(Expr::call_value(var("bump"), vec![Expr::Int(3)])),
                Stmt::Return(Some(var("count"))),
            ],
            vec![],
        );
        assert_eq!(run(&p).expect("run"), Value::Int(5));
    }

    #[test]
    fn loops_honor_break_and_continue() {
        // sum of odd i in [0, 10) stopping at 7
        let body = vec![
            Stmt::If {
                cond: bin(BinaryOp::Eq, var("i"), Expr::Int(7)),
                then: Block::new(vec![Stmt::Break]),
                otherwise: None,
            },
            Stmt::If {
                cond: bin(
                    BinaryOp::Eq,
                    bin(BinaryOp::Rem, var("i"), Expr::Int(2)),
                    Expr::Int(0),
                ),
                then: Block::new(vec![Stmt::Continue]),
                otherwise: None,
            },
            Stmt::assign("sum", bin(BinaryOp::Add, var("sum"), var("i"))),
        ];
        let p = script(
            vec![
                Stmt::let_("sum", Expr::Int(0)),
                Stmt::counted_for("i", 0, 10, body),
                Stmt::Return(Some(var("sum"))),
            ],
            vec![],
        );
        assert_eq!(run(&p).expect("run"), Value::Int(1 + 3 + 5));
    }

    #[test]
    fn do_while_runs_body_once() {
        let p = script(
            vec![
                Stmt::let_("n", Expr::Int(0)),
                Stmt::DoWhile {
                    body: Box::new(Stmt::assign("n", bin(BinaryOp::Add, var("n"), Expr::Int(1)))),
                    cond: Expr::Bool(false),
                },
                Stmt::Return(Some(var("n"))),
            ],
            vec![],
        );
        assert_eq!(run(&p).expect("run"), Value::Int(1));
    }

    #[test]
    fn byte_arrays_index_and_len() {
        let p = script(
            vec![
                Stmt::let_("b", Expr::new_bytes(Expr::Int(4))),
                Stmt::IndexAssign {
                    target: var("b"),
                    index: Expr::Int(3),
                    value: Expr::Int(300),
                },
                Stmt::Return(Some(bin(
                    BinaryOp::Add,
                    Expr::Len(Box::new(var("b"))),
                    Expr::Index {
                        target: Box::new(var("b")),
                        index: Box::new(Expr::Int(3)),
                    },
                ))),
            ],
            vec![],
        );
        assert_eq!(run(&p).expect("run"), Value::Int(4 + 44));

        let oob = script(
            vec![
                Stmt::let_("b", Expr::new_bytes(Expr::Int(1))),
                Stmt::expr(Expr::Index {
                    target: Box::new(var("b")),
                    index: Box::new(Expr::Int(1)),
                }),
            ],
            vec![],
        );
        assert!(matches!(
            run(&oob),
            Err(ExecError::OutOfBounds { index: 1, len: 1 })
        ));
    }

    #[test]
    fn fields_are_bound_before_run() {
        let mut p = script(vec![Stmt::Return(Some(var("greeting")))], vec![]);
        p.classes[0]
            .fields
            .push(FieldDecl::new("greeting", Some(Expr::str("hi"))));
        assert_eq!(run(&p).expect("run"), Value::from("hi"));
    }

    #[test]
    fn unbound_assignment_lands_in_script_binding() {
        let setter = MethodDecl::new(
            "set",
            vec![],
            Block::new(vec![Stmt::assign("shared", Expr::Int(9))]),
        );
        let p = script(
            vec![
                Stmt::expr(Expr::call("set", vec![])),
                Stmt::Return(Some(var("shared"))),
            ],
            vec![setter],
        );
        assert_eq!(run(&p).expect("run"), Value::Int(9));
    }

    #[test]
    fn throw_propagates() {
        let p = script(vec![Stmt::Throw(Expr::str("boom"))], vec![]);
        assert!(matches!(run(&p), Err(ExecError::Thrown(m)) if m == "boom"));
    }

    #[test]
    fn check_without_init_is_invalid_state() {
        let p = script(vec![Stmt::QuotaCheck], vec![]);
        assert!(matches!(
            run(&p),
            Err(ExecError::Quota(Error::InvalidState))
        ));
    }

    #[test]
    fn runaway_recursion_is_bounded() {
        let forever = MethodDecl::new(
            "again",
            vec![],
            Block::new(vec![Stmt::Return(Some(Expr::call("again", vec![])))]),
        );
        let p = script(
            vec![Stmt::Return(Some(Expr::call("again", vec![])))],
            vec![forever],
        );
        let registry = HandlerRegistry::builtin();
        let mut interp =
            Interpreter::new(&p, Arc::new(ManualCounter::new()), &registry).with_max_depth(16);
        assert!(matches!(
            interp.run_entry("Script", "run"),
            Err(ExecError::StackOverflow(16))
        ));
    }

    #[test]
    fn handler_failure_propagates_unchanged() {
        let mut registry = HandlerRegistry::new();
        registry.register_overage("H", "explode", Visibility::Public, |_| {
            Err(HandlerError::failed("handler broke"))
        });
        let counter = Arc::new(ManualCounter::new());
        counter.script(ThreadId::current(), [0, 10]);

        let p = script(
            vec![
                Stmt::QuotaInit(QuotaConfig::new(5, "H", "explode")),
                Stmt::QuotaCheck,
                Stmt::Return(Some(Expr::Int(1))),
            ],
            vec![],
        );
        let mut interp = Interpreter::new(&p, counter, &registry);
        match interp.run_entry("Script", "run") {
            Err(ExecError::Quota(Error::Handler(HandlerError::Failed(e)))) => {
                assert_eq!(e.to_string(), "handler broke");
            }
            other => panic!("unexpected {other:?}"),
        }
        let snap = interp.quota_snapshot().expect("watchdog");
        assert_eq!(snap.last_sample, 10);
        assert_eq!(snap.thread_id, ThreadId::current());
    }

    #[test]
    fn check_under_limit_keeps_running() {
        let counter = Arc::new(ManualCounter::new());
        counter.script(ThreadId::current(), [100, 150, 200]);
        let registry = HandlerRegistry::builtin();
        let p = script(
            vec![
                Stmt::QuotaInit(QuotaConfig::new(100, "QuotaInfringementHandler", "handle")),
                Stmt::QuotaCheck,
                Stmt::QuotaCheck,
                Stmt::Return(Some(Expr::Int(5))),
            ],
            vec![],
        );
        let mut interp = Interpreter::new(&p, counter, &registry);
        assert_eq!(interp.run_entry("Script", "run").expect("run"), Value::Int(5));
        let snap = interp.quota_snapshot().expect("watchdog");
        assert_eq!((snap.maximum, snap.average, snap.checks), (100, 75, 2));
    }

    #[test]
    fn reentering_entry_keeps_the_first_baseline() {
        let mut registry = HandlerRegistry::new();
        registry.register_overage("H", "note", Visibility::Public, |_| Ok(()));
        let counter = Arc::new(ManualCounter::new());
        counter.script(ThreadId::current(), [100, 150, 500]);

        let mut p = script(
            vec![
                Stmt::QuotaInit(QuotaConfig::new(100, "H", "note")),
                Stmt::If {
                    cond: var("first"),
                    then: Block::new(vec![
                        Stmt::assign("first", Expr::Bool(false)),
                        Stmt::expr(Expr::call("run", vec![])),
                    ]),
                    otherwise: None,
                },
                Stmt::QuotaCheck,
                Stmt::Return(Some(Expr::Int(1))),
            ],
            vec![],
        );
        p.classes[0]
            .fields
            .push(FieldDecl::new("first", Some(Expr::Bool(true))));

        let mut interp = Interpreter::new(&p, counter, &registry);
        assert_eq!(interp.run_entry("Script", "run").expect("run"), Value::Int(1));
        let snap = interp.quota_snapshot().expect("watchdog");
        assert_eq!(snap.base_usage, 100);
        assert_eq!((snap.checks, snap.maximum), (2, 400));
    }

    #[test]
    fn deep_expressions_hit_the_nesting_limit() {
        let mut e = Expr::Bool(true);
        for _ in 0..64 {
            e = Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(e),
            };
        }
        let p = script(vec![Stmt::Return(Some(e))], vec![]);
        let registry = HandlerRegistry::builtin();

        let mut shallow =
            Interpreter::new(&p, Arc::new(ManualCounter::new()), &registry).with_max_nesting(32);
        assert!(matches!(
            shallow.run_entry("Script", "run"),
            Err(ExecError::NestingTooDeep(32))
        ));

        let mut roomy = Interpreter::new(&p, Arc::new(ManualCounter::new()), &registry);
        assert_eq!(roomy.run_entry("Script", "run").expect("run"), Value::Bool(true));
    }

    #[test]
    fn closures_from_one_literal_share_the_body() {
        let make = MethodDecl::new(
            "make",
            vec![],
            Block::new(vec![Stmt::Return(Some(Expr::closure(
                vec![],
                vec![Stmt::Return(Some(Expr::Int(1)))],
            )))]),
        );
        let p = script(
            vec![
                Stmt::assign("a", Expr::call("make", vec![])),
                Stmt::assign("b", Expr::call("make", vec![])),
            ],
            vec![make],
        );
        let registry = HandlerRegistry::builtin();
        let mut interp = Interpreter::new(&p, Arc::new(ManualCounter::new()), &registry);
        interp.run_entry("Script", "run").expect("run");

        let body_of = |name: &str| match interp.global(name) {
            Some(Value::Closure(c)) => Arc::clone(&c.body),
            other => panic!("{name} is {other:?}"),
        };
        let (a, b) = (body_of("a"), body_of("b"));
        assert!(Arc::ptr_eq(&a, &b));

        let literal = match &body_of_program(&p, "make").stmts[0] {
            Stmt::Return(Some(Expr::Closure(c))) => Arc::clone(&c.body),
            other => panic!("unexpected {other:?}"),
        };
        assert!(Arc::ptr_eq(&a, &literal));
    }

    fn body_of_program<'a>(p: &'a Program, method: &str) -> &'a Block {
        p.classes[0]
            .method(method)
            .and_then(|m| m.body.as_ref())
            .expect("body")
    }
}
