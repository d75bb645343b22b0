use std::sync::Arc;

use jinx_source::Span;
use rustc_hash::FxHashSet;

use crate::value::Value;

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    #[must_use]
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Build a macro definition statement; tag handlers use this to bind
    /// bodies under whatever name they choose.
    #[must_use]
    pub fn macro_def(name: String, params: Vec<Param>, body: Vec<Stmt>, span: Span) -> Self {
        Self::new(
            StmtKind::Macro(Arc::new(MacroDef::new(name, params, body, span))),
            span,
        )
    }
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    Text(String),
    Output(Expr),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Vec<Stmt>,
    },
    For(Box<ForLoop>),
    Set {
        target: Target,
        value: Expr,
    },
    SetBlock {
        target: Target,
        body: Vec<Stmt>,
    },
    Macro(Arc<MacroDef>),
    CallBlock {
        call: Expr,
        caller: Arc<MacroDef>,
    },
    Do(Expr),
}

#[derive(Clone, Debug)]
pub struct ForLoop {
    pub target: Target,
    pub iter: Expr,
    pub filter: Option<Expr>,
    pub body: Vec<Stmt>,
    pub otherwise: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Name(String),
    Tuple(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Clone, Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
    pub catch_varargs: bool,
    pub catch_kwargs: bool,
    pub caller: bool,
}

impl MacroDef {
    #[must_use]
    pub fn new(name: String, params: Vec<Param>, body: Vec<Stmt>, span: Span) -> Self {
        let mut names = FxHashSet::default();
        collect_stmts(&body, &mut names);
        for param in &params {
            if let Some(default) = &param.default {
                collect_expr(default, &mut names);
            }
        }
        let declared = |name: &str| params.iter().any(|param| param.name == name);

        Self {
            catch_varargs: names.contains("varargs") && !declared("varargs"),
            catch_kwargs: names.contains("kwargs") && !declared("kwargs"),
            caller: names.contains("caller") && !declared("caller"),
            name,
            params,
            body,
            span,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    #[must_use]
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// The literal string if this expression is a string constant.
    #[must_use]
    pub fn as_const_str(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Const(value) => value.as_str(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Const(Value),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    GetAttr {
        obj: Box<Expr>,
        attr: String,
    },
    GetItem {
        obj: Box<Expr>,
        key: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Filter {
        expr: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Test {
        expr: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Cond {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

fn collect_stmts(stmts: &[Stmt], names: &mut FxHashSet<String>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Text(_) => {}
            StmtKind::Output(expr) | StmtKind::Do(expr) | StmtKind::Set { value: expr, .. } => {
                collect_expr(expr, names);
            }
            StmtKind::If { branches, otherwise } => {
                for (test, body) in branches {
                    collect_expr(test, names);
                    collect_stmts(body, names);
                }
                collect_stmts(otherwise, names);
            }
            StmtKind::For(for_loop) => {
                collect_expr(&for_loop.iter, names);
                if let Some(filter) = &for_loop.filter {
                    collect_expr(filter, names);
                }
                collect_stmts(&for_loop.body, names);
                collect_stmts(&for_loop.otherwise, names);
            }
            StmtKind::SetBlock { body, .. } => collect_stmts(body, names),
            // nested definitions resolve these names against their own frames
            StmtKind::Macro(_) => {}
            StmtKind::CallBlock { call, .. } => collect_expr(call, names),
        }
    }
}

fn collect_expr(expr: &Expr, names: &mut FxHashSet<String>) {
    match &expr.kind {
        ExprKind::Const(_) => {}
        ExprKind::Name(name) => {
            names.insert(name.clone());
        }
        ExprKind::List(items) => items.iter().for_each(|item| collect_expr(item, names)),
        ExprKind::Dict(pairs) => {
            for (key, value) in pairs {
                collect_expr(key, names);
                collect_expr(value, names);
            }
        }
        ExprKind::GetAttr { obj, .. } => collect_expr(obj, names),
        ExprKind::GetItem { obj, key } => {
            collect_expr(obj, names);
            collect_expr(key, names);
        }
        ExprKind::Call { func: target, args, kwargs }
        | ExprKind::Filter {
            expr: target,
            args,
            kwargs,
            ..
        } => {
            collect_expr(target, names);
            args.iter().for_each(|arg| collect_expr(arg, names));
            kwargs.iter().for_each(|(_, arg)| collect_expr(arg, names));
        }
        ExprKind::Test { expr, args, .. } => {
            collect_expr(expr, names);
            args.iter().for_each(|arg| collect_expr(arg, names));
        }
        ExprKind::Unary { expr, .. } => collect_expr(expr, names),
        ExprKind::Binary { left, right, .. } => {
            collect_expr(left, names);
            collect_expr(right, names);
        }
        ExprKind::Cond {
            test,
            then,
            otherwise,
        } => {
            collect_expr(test, names);
            collect_expr(then, names);
            if let Some(otherwise) = otherwise {
                collect_expr(otherwise, names);
            }
        }
    }
}
