//! The `${a.b.c}` template expression resolver: lexer, recursive-descent
//! parser, and tree-walking evaluator, plus the recursive value-tree driver
//! that understands the reserved `$merge` object-spread key.
//!
//! There is no equivalent of this in the teacher (`cloud-conveyor` never
//! templates its YAML), so this module is grounded directly on spec.md
//! §4.1/§9 and written the way the rest of this crate is written: a small
//! hand-rolled state machine with `thiserror`-style structured errors,
//! mirroring the parser-ish code in `cloud-conveyor-core::webhook`
//! (regex-driven trigger matching) in its preference for plain,
//! non-generic recursive functions over a parser-combinator dependency.

use serde_json::{Map, Value};
use std::fmt;

/// A single segment of a resolved key path: `a.b[0].c` -> `[Key("a"),
/// Key("b"), Index(0), Key("c")]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    /// A `.name` or leading bare identifier segment.
    Key(String),
    /// A `[n]` index segment.
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Renders a key path back to its dotted string form, e.g. `a.b[0].c`.
pub fn path_to_string(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for (i, seg) in path.iter().enumerate() {
        match seg {
            PathSegment::Key(k) => {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(k);
            }
            PathSegment::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// The outcome of a single context lookup, per spec.md §4.2:
/// `resolve(key_path, opts) -> { resolved?, message?, partial? }`.
#[derive(Clone, Debug, Default)]
pub struct LookupResult {
    /// The resolved value, if the context has one for this path right now.
    pub resolved: Option<Value>,
    /// A human-readable note (e.g. why it's unresolved).
    pub message: Option<String>,
    /// True if the context wants the overall resolution to be treated as
    /// partial even when `allow_partial` would otherwise be false (used by
    /// [`ScanContext`]).
    pub partial: bool,
    /// True if this lookup revisited a node still being resolved. Takes
    /// priority over a plain missing-key failure (spec.md §4.2).
    pub circular: bool,
}

impl LookupResult {
    fn found(value: Value) -> Self {
        Self {
            resolved: Some(value),
            message: None,
            partial: false,
            circular: false,
        }
    }

    fn missing(message: impl Into<String>) -> Self {
        Self {
            resolved: None,
            message: Some(message.into()),
            partial: false,
            circular: false,
        }
    }

    /// A lookup that failed because the key is still being resolved further
    /// up the call stack (a dependency cycle).
    pub fn circular(message: impl Into<String>) -> Self {
        Self {
            resolved: None,
            message: Some(message.into()),
            partial: false,
            circular: true,
        }
    }
}

/// Options controlling a single resolution pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveOptions {
    /// When true, a clause whose operands cannot all be resolved falls back
    /// to its original source text instead of producing an error.
    pub allow_partial: bool,
    /// When true, the `$${` escape is unescaped to `${` in the output.
    pub unescape: bool,
}

/// A lookup scope. Implementations form the layered hierarchy described in
/// spec.md §4.2 (`ProjectContext ⊃ EnvironmentContext ⊃ ...`).
pub trait Context {
    /// Resolves a single key path against this scope.
    fn resolve(&self, key_path: &[PathSegment], opts: &ResolveOptions) -> LookupResult;
}

/// A `Context` over a flat JSON object, used for static scopes (project
/// variables, environment variables, secrets).
#[derive(Clone, Debug, Default)]
pub struct StaticContext {
    data: Value,
}

impl StaticContext {
    /// Wraps a pre-built JSON value as a static scope.
    pub fn new(data: Value) -> Self {
        Self { data }
    }
}

impl Context for StaticContext {
    fn resolve(&self, key_path: &[PathSegment], _opts: &ResolveOptions) -> LookupResult {
        let mut current = &self.data;
        for seg in key_path {
            let next = match (seg, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k),
                (PathSegment::Index(i), Value::Array(arr)) => arr.get(*i),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => {
                    return LookupResult::missing(format!(
                        "key '{}' not found",
                        path_to_string(key_path)
                    ))
                }
            }
        }
        LookupResult::found(current.clone())
    }
}

/// A scanning context used to discover every key path a spec touches
/// without requiring a value for any of them (spec.md §4.1 "Scanning mode").
/// Always reports `partial: true` so the driving resolver falls back to
/// source text for every clause, never erroring.
#[derive(Default)]
pub struct ScanContext {
    found: std::sync::Mutex<std::collections::BTreeSet<String>>,
}

impl ScanContext {
    /// Creates an empty scan context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the set of key paths observed during the scan.
    pub fn into_found_keys(self) -> std::collections::BTreeSet<String> {
        self.found.into_inner().expect("scan mutex poisoned")
    }

    /// Returns a snapshot of the key paths observed so far.
    pub fn found_keys(&self) -> std::collections::BTreeSet<String> {
        self.found.lock().expect("scan mutex poisoned").clone()
    }
}

impl Context for ScanContext {
    fn resolve(&self, key_path: &[PathSegment], _opts: &ResolveOptions) -> LookupResult {
        self.found
            .lock()
            .expect("scan mutex poisoned")
            .insert(path_to_string(key_path));
        LookupResult {
            resolved: None,
            message: Some("scanning".into()),
            partial: true,
            circular: false,
        }
    }
}

/// Kinds of failure the resolver can report, matching spec.md's error
/// vocabulary (`missing-key`, `type-mismatch`, `circular-reference`,
/// `template-structure`).
#[derive(Clone, Debug, PartialEq)]
pub enum TemplateError {
    /// An operand referenced a key path with no value in any scope.
    MissingKey(String),
    /// An operator was applied to operands of an incompatible type.
    TypeMismatch(String),
    /// A context detected a dependency cycle while resolving a lazy value.
    CircularReference(String),
    /// `if`/`else`/`endif` clauses were unbalanced or malformed.
    TemplateStructure(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::MissingKey(m) => write!(f, "missing-key: {m}"),
            TemplateError::TypeMismatch(m) => write!(f, "type-mismatch: {m}"),
            TemplateError::CircularReference(m) => write!(f, "circular-reference: {m}"),
            TemplateError::TemplateStructure(m) => write!(f, "template-structure: {m}"),
        }
    }
}

impl std::error::Error for TemplateError {}

type EvalResult<T> = std::result::Result<T, TemplateError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Clone, Debug)]
enum Expr {
    Literal(Value),
    Path(Vec<PathSegment>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// A parsed, not-yet-rendered template string.
#[derive(Clone, Debug)]
pub struct Template {
    nodes: Vec<Node>,
}

#[derive(Clone, Debug)]
enum Node {
    Literal(String),
    /// One occurrence of the `$${` escape (spec.md §4.1). Kept distinct from
    /// an ordinary `Literal("${")` because whether it renders as `${` or is
    /// left as `$${` depends on `opts.unescape`, which isn't known until
    /// resolve time — `Template::parse` runs once and is reused across
    /// resolves with different options.
    EscapedBrace,
    Expr {
        expr: Expr,
        optional: bool,
        source: String,
    },
    Conditional {
        cond: Expr,
        cond_source: String,
        then_branch: Vec<Node>,
        else_branch: Vec<Node>,
    },
}

struct Frame {
    cond: Option<Expr>,
    cond_source: String,
    then_nodes: Vec<Node>,
    else_nodes: Vec<Node>,
    in_else: bool,
}

impl Template {
    /// Parses the template grammar described in spec.md §4.1.
    pub fn parse(input: &str) -> EvalResult<Template> {
        let mut stack = vec![Frame {
            cond: None,
            cond_source: String::new(),
            then_nodes: Vec::new(),
            else_nodes: Vec::new(),
            in_else: false,
        }];

        let chars: Vec<char> = input.chars().collect();
        let starts_with = |pos: usize, pat: &str| -> bool {
            let pat_chars: Vec<char> = pat.chars().collect();
            pos + pat_chars.len() <= chars.len() && chars[pos..pos + pat_chars.len()] == pat_chars[..]
        };
        let mut i = 0usize;
        let mut literal = String::new();

        macro_rules! flush_literal {
            () => {
                if !literal.is_empty() {
                    push_node(&mut stack, Node::Literal(std::mem::take(&mut literal)));
                }
            };
        }

        while i < chars.len() {
            if starts_with(i, "$${") {
                flush_literal!();
                push_node(&mut stack, Node::EscapedBrace);
                i += 3;
                continue;
            }
            if starts_with(i, "${") {
                flush_literal!();
                let clause_start = i;
                i += 2;
                let clause_body_start = i;
                let mut depth = 1usize;
                while i < chars.len() && depth > 0 {
                    if starts_with(i, "${") {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '}' {
                        depth -= 1;
                        i += 1;
                    } else {
                        i += 1;
                    }
                }
                if depth != 0 {
                    return Err(TemplateError::TemplateStructure(format!(
                        "unterminated clause starting at char {clause_start}"
                    )));
                }
                let body: String = chars[clause_body_start..i - 1].iter().collect();
                let optional = if i < chars.len() && chars[i] == '?' {
                    i += 1;
                    true
                } else {
                    false
                };
                let source: String = chars[clause_start..i].iter().collect();
                let trimmed = body.trim();

                if let Some(rest) = trimmed.strip_prefix("if ") {
                    let cond = parse_expr(rest)?;
                    stack.push(Frame {
                        cond: Some(cond),
                        cond_source: source,
                        then_nodes: Vec::new(),
                        else_nodes: Vec::new(),
                        in_else: false,
                    });
                } else if trimmed == "else" {
                    if stack.len() <= 1 {
                        return Err(TemplateError::TemplateStructure(
                            "unmatched ${else}".to_string(),
                        ));
                    }
                    stack.last_mut().unwrap().in_else = true;
                } else if trimmed == "endif" {
                    if stack.len() <= 1 {
                        return Err(TemplateError::TemplateStructure(
                            "unmatched ${endif}".to_string(),
                        ));
                    }
                    let frame = stack.pop().unwrap();
                    let node = Node::Conditional {
                        cond: frame.cond.unwrap(),
                        cond_source: frame.cond_source,
                        then_branch: frame.then_nodes,
                        else_branch: frame.else_nodes,
                    };
                    push_node(&mut stack, node);
                } else {
                    let expr = parse_expr(trimmed)?;
                    push_node(
                        &mut stack,
                        Node::Expr {
                            expr,
                            optional,
                            source,
                        },
                    );
                }
                continue;
            }
            literal.push(chars[i]);
            i += 1;
        }
        flush_literal!();

        if stack.len() != 1 {
            return Err(TemplateError::TemplateStructure(
                "missing ${endif} for an opened ${if}".to_string(),
            ));
        }
        Ok(Template {
            nodes: stack.pop().unwrap().then_nodes,
        })
    }

    /// Resolves this template against `ctx`. Returns a typed [`Value`]:
    /// if the template is exactly one `${...}` clause with no surrounding
    /// literal text, the clause's native value is returned unconverted;
    /// otherwise all nodes are stringified and concatenated.
    pub fn resolve(&self, ctx: &dyn Context, opts: &ResolveOptions) -> EvalResult<Value> {
        if let [Node::Expr { .. }] = self.nodes.as_slice() {
            return resolve_node(&self.nodes[0], ctx, opts);
        }
        if let [Node::Conditional { .. }] = self.nodes.as_slice() {
            return resolve_node(&self.nodes[0], ctx, opts);
        }
        let mut out = String::new();
        for node in &self.nodes {
            let v = resolve_node(node, ctx, opts)?;
            out.push_str(&stringify(&v));
        }
        Ok(Value::String(out))
    }
}

fn push_node(stack: &mut [Frame], node: Node) {
    let frame = stack.last_mut().expect("stack always has a root frame");
    if frame.in_else {
        frame.else_nodes.push(node);
    } else {
        frame.then_nodes.push(node);
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve_node(node: &Node, ctx: &dyn Context, opts: &ResolveOptions) -> EvalResult<Value> {
    match node {
        Node::Literal(s) => Ok(Value::String(s.clone())),
        Node::EscapedBrace => Ok(Value::String(
            if opts.unescape { "${" } else { "$${" }.to_string(),
        )),
        Node::Expr {
            expr,
            optional,
            source,
        } => match eval(expr, ctx, opts) {
            Ok(v) => Ok(v),
            Err(e) if *optional => {
                let _ = e;
                Ok(Value::Null)
            }
            Err(e) if opts.allow_partial => {
                let _ = e;
                Ok(Value::String(source.clone()))
            }
            Err(e) => Err(e),
        },
        Node::Conditional {
            cond,
            cond_source,
            then_branch,
            else_branch,
        } => match eval(cond, ctx, opts) {
            Ok(v) => {
                let branch = if truthy(&v) { then_branch } else { else_branch };
                let mut out = String::new();
                for n in branch {
                    out.push_str(&stringify(&resolve_node(n, ctx, opts)?));
                }
                Ok(Value::String(out))
            }
            Err(_) if opts.allow_partial => Ok(Value::String(cond_source.clone())),
            Err(e) => Err(e),
        },
    }
}

/// JS-like truthiness: `null`, `false`, `0`, empty string, empty array are
/// falsy; everything else (including objects) is truthy.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn lookup(path: &[PathSegment], ctx: &dyn Context, opts: &ResolveOptions) -> EvalResult<Value> {
    let result = ctx.resolve(path, opts);
    match result.resolved {
        Some(v) => Ok(v),
        None if result.circular => Err(TemplateError::CircularReference(
            result.message.unwrap_or_else(|| path_to_string(path)),
        )),
        None => Err(TemplateError::MissingKey(path_to_string(path))),
    }
}

fn eval(expr: &Expr, ctx: &dyn Context, opts: &ResolveOptions) -> EvalResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(p) => lookup(p, ctx, opts),
        Expr::Not(inner) => {
            let v = eval(inner, ctx, opts)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx, opts),
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &dyn Context,
    opts: &ResolveOptions,
) -> EvalResult<Value> {
    // Short-circuit operators return the raw (uncoerced) operand value.
    if op == BinOp::And {
        let l = eval(lhs, ctx, opts)?;
        if !truthy(&l) {
            return Ok(l);
        }
        return eval(rhs, ctx, opts);
    }
    if op == BinOp::Or {
        let l = eval(lhs, ctx, opts)?;
        if truthy(&l) {
            return Ok(l);
        }
        return eval(rhs, ctx, opts);
    }

    let l = eval(lhs, ctx, opts)?;
    let r = eval(rhs, ctx, opts)?;

    match op {
        BinOp::Add => match (&l, &r) {
            (Value::Number(a), Value::Number(b)) => {
                Ok(num(a.as_f64().unwrap() + b.as_f64().unwrap()))
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.clone());
                Ok(Value::Array(out))
            }
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Err(TemplateError::TypeMismatch(
                "`+` requires two numbers, two arrays, or two strings".into(),
            )),
        },
        BinOp::Eq | BinOp::Ne => {
            if is_primitive(&l) && is_primitive(&r) {
                let eq = l == r;
                Ok(Value::Bool(if op == BinOp::Eq { eq } else { !eq }))
            } else {
                Err(TemplateError::TypeMismatch(
                    "`==`/`!=` only support primitive operands".into(),
                ))
            }
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Lt | BinOp::Le | BinOp::Gt
        | BinOp::Ge => {
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(TemplateError::TypeMismatch(format!(
                        "`{op:?}` requires numeric operands"
                    )))
                }
            };
            match op {
                BinOp::Sub => Ok(num(a - b)),
                BinOp::Mul => Ok(num(a * b)),
                BinOp::Div => {
                    if b == 0.0 {
                        Err(TemplateError::TypeMismatch("division by zero".into()))
                    } else {
                        Ok(num(a / b))
                    }
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        Err(TemplateError::TypeMismatch("modulo by zero".into()))
                    } else {
                        Ok(num(a % b))
                    }
                }
                BinOp::Lt => Ok(Value::Bool(a < b)),
                BinOp::Le => Ok(Value::Bool(a <= b)),
                BinOp::Gt => Ok(Value::Bool(a > b)),
                BinOp::Ge => Ok(Value::Bool(a >= b)),
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn is_primitive(v: &Value) -> bool {
    !matches!(v, Value::Array(_) | Value::Object(_))
}

fn num(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

trait AsF64 {
    fn as_f64(&self) -> Option<f64>;
}

impl AsF64 for Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

// ---- expression lexer/parser ----

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Op(&'static str),
    Bang,
}

fn lex(input: &str) -> EvalResult<Vec<Tok>> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '.' => {
                out.push(Tok::Dot);
                i += 1;
            }
            '[' => {
                out.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                out.push(Tok::RBracket);
                i += 1;
            }
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(TemplateError::TemplateStructure(
                        "unterminated string literal".into(),
                    ));
                }
                i += 1; // closing quote
                out.push(Tok::Str(s));
            }
            '+' | '-' | '*' | '/' | '%' => {
                out.push(Tok::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    _ => "%",
                }));
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op("=="));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op("!="));
                i += 2;
            }
            '!' => {
                out.push(Tok::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op("<="));
                i += 2;
            }
            '<' => {
                out.push(Tok::Op("<"));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                out.push(Tok::Op(">="));
                i += 2;
            }
            '>' => {
                out.push(Tok::Op(">"));
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                out.push(Tok::Op("&&"));
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                out.push(Tok::Op("||"));
                i += 2;
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| {
                    TemplateError::TemplateStructure(format!("invalid number '{text}'"))
                })?;
                out.push(Tok::Number(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                out.push(match text.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(text),
                });
            }
            _ => {
                return Err(TemplateError::TemplateStructure(format!(
                    "unexpected character '{c}'"
                )))
            }
        }
    }
    Ok(out)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some(Tok::Op(o)) = self.peek() {
            if ops.contains(o) {
                let o = *o;
                self.pos += 1;
                return Some(o);
            }
        }
        None
    }

    fn parse_or(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_eq()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.parse_eq()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_eq(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_cmp()?;
        while let Some(op) = self.eat_op(&["==", "!="]) {
            let rhs = self.parse_cmp()?;
            let bop = if op == "==" { BinOp::Eq } else { BinOp::Ne };
            lhs = Expr::Binary(bop, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_add()?;
        while let Some(op) = self.eat_op(&["<", "<=", ">", ">="]) {
            let rhs = self.parse_add()?;
            let bop = match op {
                "<" => BinOp::Lt,
                "<=" => BinOp::Le,
                ">" => BinOp::Gt,
                _ => BinOp::Ge,
            };
            lhs = Expr::Binary(bop, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_mul()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.parse_mul()?;
            let bop = if op == "+" { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Binary(bop, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> EvalResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let rhs = self.parse_unary()?;
            let bop = match op {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                _ => BinOp::Mod,
            };
            lhs = Expr::Binary(bop, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> EvalResult<Expr> {
        if matches!(self.peek(), Some(Tok::Bang)) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if matches!(self.peek(), Some(Tok::Op("-"))) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Binary(
                BinOp::Sub,
                Box::new(Expr::Literal(Value::from(0.0))),
                Box::new(inner),
            ));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> EvalResult<Expr> {
        match self.bump() {
            Some(Tok::Number(n)) => Ok(Expr::Literal(num(n))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Tok::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Tok::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                if !matches!(self.bump(), Some(Tok::RParen)) {
                    return Err(TemplateError::TemplateStructure("expected ')'".into()));
                }
                Ok(inner)
            }
            Some(Tok::Ident(name)) => {
                let mut path = vec![PathSegment::Key(name)];
                loop {
                    match self.peek() {
                        Some(Tok::Dot) => {
                            self.pos += 1;
                            match self.bump() {
                                Some(Tok::Ident(name)) => path.push(PathSegment::Key(name)),
                                _ => {
                                    return Err(TemplateError::TemplateStructure(
                                        "expected identifier after '.'".into(),
                                    ))
                                }
                            }
                        }
                        Some(Tok::LBracket) => {
                            self.pos += 1;
                            match self.bump() {
                                Some(Tok::Number(n)) => {
                                    path.push(PathSegment::Index(n as usize))
                                }
                                _ => {
                                    return Err(TemplateError::TemplateStructure(
                                        "expected index inside '[...]'".into(),
                                    ))
                                }
                            }
                            if !matches!(self.bump(), Some(Tok::RBracket)) {
                                return Err(TemplateError::TemplateStructure(
                                    "expected ']'".into(),
                                ));
                            }
                        }
                        _ => break,
                    }
                }
                Ok(Expr::Path(path))
            }
            other => Err(TemplateError::TemplateStructure(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

fn parse_expr(input: &str) -> EvalResult<Expr> {
    let toks = lex(input)?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.toks.len() {
        return Err(TemplateError::TemplateStructure(format!(
            "trailing tokens after expression in '{input}'"
        )));
    }
    Ok(expr)
}

/// Resolves `input` against `ctx` with `opts`, returning the resolved
/// [`Value`] (see [`Template::resolve`] for the single-clause/typed-value
/// rule).
pub fn resolve(input: &str, ctx: &dyn Context, opts: &ResolveOptions) -> EvalResult<Value> {
    let tmpl = Template::parse(input)?;
    tmpl.resolve(ctx, opts)
}

/// Convenience wrapper returning a `String` (stringifying typed results).
pub fn resolve_string(input: &str, ctx: &dyn Context, opts: &ResolveOptions) -> EvalResult<String> {
    Ok(stringify(&resolve(input, ctx, opts)?))
}

/// Recursively walks a JSON value tree, resolving every string leaf and
/// expanding `$merge` keys depth-first, leaves-first (spec.md §4.1/§9).
pub fn resolve_value_tree(
    value: &Value,
    ctx: &dyn Context,
    opts: &ResolveOptions,
) -> EvalResult<Value> {
    match value {
        Value::String(s) => resolve(s, ctx, opts),
        Value::Array(arr) => {
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                out.push(resolve_value_tree(item, ctx, opts)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut resolved_children = Map::new();
            for (k, v) in map {
                resolved_children.insert(k.clone(), resolve_value_tree(v, ctx, opts)?);
            }
            if let Some(merge_source) = resolved_children.remove("$merge") {
                let base = match merge_source {
                    Value::Object(m) => m,
                    _ => {
                        return Err(TemplateError::TypeMismatch(
                            "$merge must resolve to a mapping".into(),
                        ))
                    }
                };
                let mut out = base;
                for (k, v) in resolved_children {
                    out.insert(k, v);
                }
                Ok(Value::Object(out))
            } else {
                Ok(Value::Object(resolved_children))
            }
        }
        other => Ok(other.clone()),
    }
}

/// Scans `input` in partial mode, returning the set of key paths touched,
/// per spec.md §4.1 "Scanning mode" / §4.3 step 2.
pub fn scan_value_tree(value: &Value) -> std::collections::BTreeSet<String> {
    let scan_ctx = ScanContext::new();
    let opts = ResolveOptions {
        allow_partial: true,
        unescape: false,
    };
    let _ = resolve_value_tree(value, &scan_ctx, &opts);
    scan_ctx.into_found_keys()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(pairs: &[(&str, Value)]) -> StaticContext {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert((*k).to_string(), v.clone());
        }
        StaticContext::new(Value::Object(map))
    }

    #[test]
    fn escape_round_trips_with_unescape() {
        let ctx = StaticContext::default();
        let opts = ResolveOptions {
            allow_partial: false,
            unescape: true,
        };
        let out = resolve("$${x}", &ctx, &opts).unwrap();
        assert_eq!(out, Value::String("${x}".to_string()));
    }

    #[test]
    fn escape_left_intact_without_unescape() {
        let ctx = StaticContext::default();
        let opts = ResolveOptions {
            allow_partial: false,
            unescape: false,
        };
        let out = resolve("$${x}", &ctx, &opts).unwrap();
        assert_eq!(out, Value::String("$${x}".to_string()));
    }

    #[test]
    fn single_clause_returns_typed_value() {
        let ctx = ctx_with(&[("port", Value::from(8080))]);
        let opts = ResolveOptions::default();
        let v = resolve("${port}", &ctx, &opts).unwrap();
        assert_eq!(v, Value::from(8080));
    }

    #[test]
    fn mixed_literal_and_clause_stringifies() {
        let ctx = ctx_with(&[("name", Value::String("api".into()))]);
        let opts = ResolveOptions::default();
        let v = resolve("svc-${name}", &ctx, &opts).unwrap();
        assert_eq!(v, Value::String("svc-api".to_string()));
    }

    #[test]
    fn partial_mode_preserves_unresolvable_clause() {
        let ctx = StaticContext::default();
        let opts = ResolveOptions {
            allow_partial: true,
            unescape: false,
        };
        let v = resolve("${actions.build.api.outputs.image}", &ctx, &opts).unwrap();
        assert_eq!(
            v,
            Value::String("${actions.build.api.outputs.image}".to_string())
        );
    }

    #[test]
    fn missing_key_fails_without_partial_or_optional() {
        let ctx = StaticContext::default();
        let opts = ResolveOptions::default();
        let err = resolve("${nope}", &ctx, &opts).unwrap_err();
        assert!(matches!(err, TemplateError::MissingKey(_)));
    }

    #[test]
    fn optional_suffix_is_non_fatal() {
        let ctx = StaticContext::default();
        let opts = ResolveOptions::default();
        let v = resolve("${nope}?", &ctx, &opts).unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn or_returns_raw_operand_not_bool() {
        let ctx = ctx_with(&[("fallback", Value::String("dev".into()))]);
        let opts = ResolveOptions::default();
        let v = resolve("${nope}? || ${fallback}", &ctx, &opts).unwrap();
        assert_eq!(v, Value::String("dev".to_string()));
    }

    #[test]
    fn conditional_block_picks_branch() {
        let ctx = ctx_with(&[("debug", Value::Bool(true))]);
        let opts = ResolveOptions::default();
        let v = resolve("${if debug}on${else}off${endif}", &ctx, &opts).unwrap();
        assert_eq!(v, Value::String("on".to_string()));
    }

    #[test]
    fn unmatched_endif_is_template_structure_error() {
        let err = Template::parse("${endif}").unwrap_err();
        assert!(matches!(err, TemplateError::TemplateStructure(_)));
    }

    #[test]
    fn missing_endif_is_template_structure_error() {
        let err = Template::parse("${if a}x").unwrap_err();
        assert!(matches!(err, TemplateError::TemplateStructure(_)));
    }

    #[test]
    fn arithmetic_on_arrays_concatenates() {
        let ctx = ctx_with(&[
            ("a", Value::Array(vec![Value::from(1)])),
            ("b", Value::Array(vec![Value::from(2)])),
        ]);
        let opts = ResolveOptions::default();
        let v = resolve("${a + b}", &ctx, &opts).unwrap();
        assert_eq!(v, Value::Array(vec![Value::from(1), Value::from(2)]));
    }

    #[test]
    fn equality_on_objects_is_type_mismatch() {
        let ctx = ctx_with(&[
            ("a", Value::Object(Map::new())),
            ("b", Value::Object(Map::new())),
        ]);
        let opts = ResolveOptions::default();
        let err = resolve("${a == b}", &ctx, &opts).unwrap_err();
        assert!(matches!(err, TemplateError::TypeMismatch(_)));
    }

    #[test]
    fn merge_key_spreads_with_literal_override() {
        let mut base = Map::new();
        base.insert("a".into(), Value::from(1));
        base.insert("b".into(), Value::from(2));
        let ctx = ctx_with(&[("base", Value::Object(base))]);
        let opts = ResolveOptions::default();

        let mut tree = Map::new();
        tree.insert("$merge".into(), Value::String("${base}".into()));
        tree.insert("b".into(), Value::from(99));
        let resolved = resolve_value_tree(&Value::Object(tree), &ctx, &opts).unwrap();

        let mut expected = Map::new();
        expected.insert("a".into(), Value::from(1));
        expected.insert("b".into(), Value::from(99));
        assert_eq!(resolved, Value::Object(expected));
    }

    #[test]
    fn scan_records_every_key_without_resolving() {
        let mut tree = Map::new();
        tree.insert(
            "image".into(),
            Value::String("${actions.build.api.outputs.image-id}".into()),
        );
        let keys = scan_value_tree(&Value::Object(tree));
        assert!(keys.contains("actions.build.api.outputs.image-id"));
    }

    #[test]
    fn idempotent_when_fully_resolvable() {
        let ctx = ctx_with(&[("x", Value::from(5))]);
        let opts = ResolveOptions::default();
        let once = resolve_string("${x}", &ctx, &opts).unwrap();
        let twice = resolve_string(&once, &ctx, &opts).unwrap();
        assert_eq!(once, twice);
    }
}
