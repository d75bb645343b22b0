use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use indexmap::IndexMap;
use jinx_source::LineIndex;
use jinx_source::Span;
use rustc_hash::FxHashMap;

use crate::ast::BinOp;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::ForLoop;
use crate::ast::MacroDef;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::ast::Target;
use crate::ast::UnaryOp;
use crate::environment::Environment;
use crate::environment::OutputMode;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::filters;
use crate::macros::Macro;
use crate::methods;
use crate::object::CallArgs;
use crate::ops;
use crate::value::Context;
use crate::value::Value;

pub(crate) type Frame = FxHashMap<String, Value>;

/// A compiled template body plus what error locations need.
#[derive(Debug)]
pub(crate) struct Program {
    pub name: String,
    pub body: Vec<Stmt>,
    pub line_index: LineIndex,
}

/// The variables of one template execution.
///
/// Names bound at the top level (`set`, `macro`) are exports; everything the
/// caller passed in lives in `vars`.
pub(crate) struct ModuleScope {
    pub env: Arc<Environment>,
    pub program: Arc<Program>,
    pub vars: Context,
    exports: RwLock<IndexMap<String, Value>>,
}

impl ModuleScope {
    pub(crate) fn new(env: Arc<Environment>, program: Arc<Program>, vars: Context) -> Self {
        Self {
            env,
            program,
            vars,
            exports: RwLock::default(),
        }
    }

    fn export(&self, name: &str, value: Value) {
        self.exports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
    }

    fn exported(&self, name: &str) -> Option<Value> {
        self.exports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn exports(&self) -> IndexMap<String, Value> {
        self.exports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) enum Output {
    Text(String),
    Fragments(Vec<Value>),
}

impl Output {
    pub(crate) fn for_mode(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Text => Output::Text(String::new()),
            OutputMode::Native => Output::Fragments(Vec::new()),
        }
    }

    fn push_text(&mut self, text: &str) {
        match self {
            Output::Text(buffer) => buffer.push_str(text),
            Output::Fragments(fragments) => fragments.push(Value::from(text)),
        }
    }

    fn emit(&mut self, value: Value) -> Result<(), Error> {
        match self {
            Output::Text(buffer) => buffer.push_str(&value.to_output()?),
            Output::Fragments(fragments) => fragments.push(value),
        }
        Ok(())
    }

    pub(crate) fn into_text(self) -> Result<String, Error> {
        match self {
            Output::Text(buffer) => Ok(buffer),
            Output::Fragments(fragments) => fragments.iter().map(Value::to_output).collect(),
        }
    }

    pub(crate) fn into_fragments(self) -> Vec<Value> {
        match self {
            Output::Text(buffer) => vec![Value::from(buffer)],
            Output::Fragments(fragments) => fragments,
        }
    }
}

pub(crate) struct State<'s> {
    scope: &'s Arc<ModuleScope>,
    frames: Vec<Frame>,
}

impl<'s> State<'s> {
    pub(crate) fn new(scope: &'s Arc<ModuleScope>, frames: Vec<Frame>) -> Self {
        Self { scope, frames }
    }

    pub(crate) fn run(&mut self, body: &[Stmt], out: &mut Output) -> Result<(), Error> {
        for stmt in body {
            self.eval_stmt(stmt, out)
                .map_err(|err| self.locate(err, stmt.span))?;
        }
        Ok(())
    }

    fn locate(&self, err: Error, span: Span) -> Error {
        let program = &self.scope.program;
        err.located(&program.name, span, &program.line_index)
    }

    fn capture(&mut self, body: &[Stmt]) -> Result<String, Error> {
        let mut out = Output::Text(String::new());
        self.run(body, &mut out)?;
        out.into_text()
    }

    fn eval_stmt(&mut self, stmt: &Stmt, out: &mut Output) -> Result<(), Error> {
        match &stmt.kind {
            StmtKind::Text(text) => out.push_text(text),
            StmtKind::Output(expr) => {
                let value = self.eval_expr(expr)?;
                out.emit(value)?;
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (test, body) in branches {
                    if self.eval_expr(test)?.is_true()? {
                        return self.run(body, out);
                    }
                }
                self.run(otherwise, out)?;
            }
            StmtKind::For(for_loop) => self.eval_for(for_loop, out)?,
            StmtKind::Set { target, value } => {
                let value = self.eval_expr(value)?;
                self.bind(target, value)?;
            }
            StmtKind::SetBlock { target, body } => {
                let text = self.capture(body)?;
                self.bind(target, Value::from(text))?;
            }
            StmtKind::Macro(def) => {
                let value = self.make_macro(def);
                self.set_local(&def.name, value);
            }
            StmtKind::CallBlock { call, caller } => {
                let caller = self.make_macro(caller);
                let value = self.eval_call(call, Some(caller))?;
                out.emit(value)?;
            }
            StmtKind::Do(expr) => {
                self.eval_expr(expr)?;
            }
        }
        Ok(())
    }

    fn eval_for(&mut self, for_loop: &ForLoop, out: &mut Output) -> Result<(), Error> {
        let mut items = self.eval_expr(&for_loop.iter)?.try_iter()?;

        if let Some(filter) = &for_loop.filter {
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                self.frames.push(Frame::default());
                let keep = self
                    .bind(&for_loop.target, item.clone())
                    .and_then(|()| self.eval_expr(filter))
                    .and_then(|value| value.is_true());
                self.frames.pop();
                if keep? {
                    kept.push(item);
                }
            }
            items = kept;
        }

        if items.is_empty() {
            return self.run(&for_loop.otherwise, out);
        }

        let length = items.len();
        for (index, item) in items.into_iter().enumerate() {
            let mut frame = Frame::default();
            frame.insert("loop".to_string(), loop_info(index, length));
            self.frames.push(frame);
            let result = self
                .bind(&for_loop.target, item)
                .and_then(|()| self.run(&for_loop.body, out));
            self.frames.pop();
            result?;
        }
        Ok(())
    }

    fn bind(&mut self, target: &Target, value: Value) -> Result<(), Error> {
        match target {
            Target::Name(name) => {
                self.set_local(name, value);
                Ok(())
            }
            Target::Tuple(names) => {
                let items = value.try_iter()?;
                if items.len() != names.len() {
                    let message = if items.len() > names.len() {
                        format!("too many values to unpack (expected {})", names.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            names.len(),
                            items.len()
                        )
                    };
                    return Err(Error::new(ErrorKind::InvalidOperation, message));
                }
                for (name, item) in names.iter().zip(items) {
                    self.set_local(name, item);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn set_local(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), value);
            }
            None => self.scope.export(name, value),
        }
    }

    fn make_macro(&self, def: &Arc<MacroDef>) -> Value {
        Value::Macro(Arc::new(Macro::new(
            Arc::clone(def),
            Arc::downgrade(self.scope),
            self.frames.clone(),
        )))
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(name) {
                return Some(value.clone());
            }
        }
        self.scope
            .exported(name)
            .or_else(|| self.scope.vars.get(name).cloned())
            .or_else(|| self.scope.env.global(name))
    }

    pub(crate) fn undefined(&self, name: &str, hint: Option<&str>) -> Value {
        self.scope.env.undefined(name, hint)
    }

    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> Result<Value, Error> {
        match &expr.kind {
            ExprKind::Const(value) => Ok(value.clone()),
            ExprKind::Name(name) => Ok(self
                .lookup(name)
                .unwrap_or_else(|| self.undefined(name, None))),
            ExprKind::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval_expr(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::list(values))
            }
            ExprKind::Dict(pairs) => {
                let mut entries = IndexMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = match self.eval_expr(key)? {
                        Value::Str(s) => s.to_string(),
                        scalar @ (Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::None) => {
                            scalar.to_string()
                        }
                        other => {
                            return Err(Error::new(
                                ErrorKind::InvalidOperation,
                                format!("unhashable type: '{}'", other.kind_name()),
                            ));
                        }
                    };
                    let value = self.eval_expr(value)?;
                    entries.insert(key, value);
                }
                Ok(Value::map(entries))
            }
            ExprKind::GetAttr { obj, attr } => {
                let obj = self.eval_expr(obj)?;
                self.get_attr(&obj, attr)
            }
            ExprKind::GetItem { obj, key } => {
                let obj = self.eval_expr(obj)?;
                let key = self.eval_expr(key)?;
                self.get_item(&obj, &key)
            }
            ExprKind::Call { .. } => self.eval_call(expr, None),
            ExprKind::Filter {
                expr: inner,
                name,
                args,
                kwargs,
            } => {
                let value = self.eval_expr(inner)?;
                let args = self.eval_args(args, kwargs)?;
                filters::apply_filter(name, value, args)
            }
            ExprKind::Test {
                expr: inner,
                name,
                args,
                negated,
            } => {
                let value = self.eval_expr(inner)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval_expr(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let passed = filters::perform_test(name, &value, &args)?;
                Ok(Value::Bool(passed != *negated))
            }
            ExprKind::Unary { op, expr: inner } => {
                let value = self.eval_expr(inner)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_true()?)),
                    UnaryOp::Neg => ops::negate(&value),
                    UnaryOp::Pos => ops::positive(&value),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval_expr(left)?;
                match op {
                    BinOp::And if !left.is_true()? => Ok(left),
                    BinOp::Or if left.is_true()? => Ok(left),
                    BinOp::And | BinOp::Or => self.eval_expr(right),
                    _ => {
                        let right = self.eval_expr(right)?;
                        ops::binary(*op, &left, &right)
                    }
                }
            }
            ExprKind::Cond {
                test,
                then,
                otherwise,
            } => {
                if self.eval_expr(test)?.is_true()? {
                    self.eval_expr(then)
                } else if let Some(otherwise) = otherwise {
                    self.eval_expr(otherwise)
                } else {
                    Ok(self.undefined(
                        "",
                        Some("the inline if-expression evaluated to false and no else section was defined"),
                    ))
                }
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<CallArgs, Error> {
        let mut call_args = CallArgs::default();
        for arg in args {
            call_args.positional.push(self.eval_expr(arg)?);
        }
        for (name, arg) in kwargs {
            let value = self.eval_expr(arg)?;
            call_args.keyword.insert(name.clone(), value);
        }
        Ok(call_args)
    }

    fn eval_call(&mut self, expr: &Expr, caller: Option<Value>) -> Result<Value, Error> {
        let ExprKind::Call { func, args, kwargs } = &expr.kind else {
            return self.eval_expr(expr);
        };
        let mut call_args = self.eval_args(args, kwargs)?;
        if let Some(caller) = caller {
            call_args.keyword.insert("caller".to_string(), caller);
        }

        if let ExprKind::GetAttr { obj, attr } = &func.kind {
            let receiver = self.eval_expr(obj)?;
            return self.call_method(&receiver, attr, call_args);
        }
        self.eval_expr(func)?.call(call_args)
    }

    fn call_method(&self, receiver: &Value, name: &str, args: CallArgs) -> Result<Value, Error> {
        check_attribute(receiver, name)?;
        match receiver {
            Value::Map(map) => {
                if let Some(value) = map.get(name) {
                    return value.call(args);
                }
            }
            Value::Object(_) | Value::Undefined(_) => {
                return self.get_attr(receiver, name)?.call(args);
            }
            _ => {}
        }
        if let Some(method) = methods::lookup(receiver, name) {
            return method(receiver, args);
        }
        self.get_attr(receiver, name)?.call(args)
    }

    fn get_attr(&self, obj: &Value, name: &str) -> Result<Value, Error> {
        check_attribute(obj, name)?;
        match obj {
            Value::Map(map) => {
                if let Some(value) = map.get(name) {
                    return Ok(value);
                }
            }
            Value::Object(object) => {
                if let Some(value) = object.get_attr(name) {
                    return Ok(value);
                }
            }
            Value::Undefined(undefined) => return Err(undefined.error()),
            _ => {}
        }

        if let Some(method) = methods::lookup(obj, name) {
            let receiver = obj.clone();
            return Ok(Value::from_function(name, move |args| method(&receiver, args)));
        }
        let hint = format!("'{} object' has no attribute '{name}'", obj.kind_name());
        Ok(self.undefined(name, Some(&hint)))
    }

    fn get_item(&self, obj: &Value, key: &Value) -> Result<Value, Error> {
        let found = match (obj, key) {
            (Value::List(list), Value::Int(index)) => {
                normalize_index(*index, list.len()).and_then(|index| list.get(index))
            }
            (Value::Str(s), Value::Int(index)) => {
                let chars: Vec<char> = s.chars().collect();
                normalize_index(*index, chars.len()).map(|index| Value::from(chars[index].to_string()))
            }
            (Value::Map(map), Value::Str(key)) => map.get(key),
            (Value::Object(object), key) => object.get_item(key),
            (Value::Undefined(undefined), _) => return Err(undefined.error()),
            (Value::Map(_), _) => None,
            (_, Value::Str(key)) => return self.get_attr(obj, key),
            _ => None,
        };
        Ok(found.unwrap_or_else(|| {
            let name = key.to_string();
            let hint = format!("'{} object' has no element {}", obj.kind_name(), key.repr());
            self.undefined(&name, Some(&hint))
        }))
    }
}

fn check_attribute(obj: &Value, name: &str) -> Result<(), Error> {
    if name.starts_with('_') {
        return Err(Error::new(
            ErrorKind::SecurityError,
            format!(
                "access to attribute '{name}' of '{}' object is unsafe",
                obj.kind_name()
            ),
        ));
    }
    Ok(())
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn loop_info(index: usize, length: usize) -> Value {
    let mut info = IndexMap::new();
    info.insert("index".to_string(), Value::from(index + 1));
    info.insert("index0".to_string(), Value::from(index));
    info.insert("revindex".to_string(), Value::from(length - index));
    info.insert("revindex0".to_string(), Value::from(length - index - 1));
    info.insert("first".to_string(), Value::Bool(index == 0));
    info.insert("last".to_string(), Value::Bool(index + 1 == length));
    info.insert("length".to_string(), Value::from(length));
    Value::map(info)
}

/// Bind `args` to the macro's parameters and render its body.
pub(crate) fn call_macro(
    scope: &Arc<ModuleScope>,
    def: &MacroDef,
    closure: &[Frame],
    args: CallArgs,
) -> Result<Value, Error> {
    let CallArgs {
        positional,
        mut keyword,
    } = args;
    if positional.len() > def.params.len() && !def.catch_varargs {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!(
                "macro '{}' takes not more than {} argument(s)",
                def.name,
                def.params.len()
            ),
        ));
    }

    let mut frames = closure.to_vec();
    frames.push(Frame::default());
    let mut state = State::new(scope, frames);

    let mut positional = positional.into_iter();
    for param in &def.params {
        let value = if let Some(value) = positional.next() {
            if keyword.contains_key(&param.name) {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!(
                        "macro '{}' got multiple values for argument '{}'",
                        def.name, param.name
                    ),
                ));
            }
            value
        } else if let Some(value) = keyword.shift_remove(&param.name) {
            value
        } else if let Some(default) = &param.default {
            state.eval_expr(default)?
        } else {
            let hint = format!("parameter '{}' was not provided", param.name);
            state.undefined(&param.name, Some(&hint))
        };
        state.set_local(&param.name, value);
    }

    let caller = keyword.shift_remove("caller");
    if def.caller {
        let caller = caller.unwrap_or_else(|| state.undefined("caller", None));
        state.set_local("caller", caller);
    } else if caller.is_some() {
        return Err(unexpected_keyword(def, "caller"));
    }

    if def.catch_varargs {
        state.set_local("varargs", Value::list(positional.collect()));
    }
    if def.catch_kwargs {
        state.set_local("kwargs", Value::map(keyword));
    } else if let Some(name) = keyword.keys().next() {
        return Err(unexpected_keyword(def, name));
    }

    state.capture(&def.body).map(Value::from)
}

fn unexpected_keyword(def: &MacroDef, name: &str) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("macro '{}' takes no keyword argument '{name}'", def.name),
    )
}
