use crate::error::MtdbError;
use crate::mapper::key_codec::{KeyCodec, canonical_text, escape_segment};
use crate::model::{AttributeValue, KeyType, NameMap, ValueMap};
use compact_str::CompactString;
use lru::LruCache;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Maximum nesting depth for expressions to prevent stack overflow.
const MAX_EXPR_DEPTH: usize = 32;

const PARSE_CACHE_SHARDS: usize = 16;
const PARSE_CACHE_TOTAL_CAPACITY: usize = 256;
const PARSE_CACHE_PER_SHARD: usize = PARSE_CACHE_TOTAL_CAPACITY / PARSE_CACHE_SHARDS;

/// Global cache for parsed expressions so repeated requests with the same
/// expression text skip the tokenizer and parser.
type ParseCacheKey = (u8, String);
type ParseCacheShard = parking_lot::Mutex<LruCache<ParseCacheKey, Arc<Parsed>>>;
type ParseCache = [ParseCacheShard; PARSE_CACHE_SHARDS];

static PARSE_CACHE: once_cell::sync::Lazy<ParseCache> = once_cell::sync::Lazy::new(|| {
    std::array::from_fn(|_| {
        let cap = NonZeroUsize::new(PARSE_CACHE_PER_SHARD).unwrap_or(NonZeroUsize::MIN);
        parking_lot::Mutex::new(LruCache::new(cap))
    })
});

fn parse_cache_shard_idx(cache_key: &ParseCacheKey) -> usize {
    let mut hasher = DefaultHasher::new();
    cache_key.hash(&mut hasher);
    (hasher.finish() as usize) % PARSE_CACHE_SHARDS
}

/// Which request field an expression came from. Conditions, filters, and
/// key conditions share a grammar; key conditions get extra structural
/// restrictions, and updates and projections have grammars of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionRole {
    Condition,
    Filter,
    KeyCondition,
    Projection,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Parsed {
    Cond(CondExpr),
    Update(UpdateExpr),
    Projection(Vec<Path>),
}

// ---------------------------------------------------------------------------
// tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(CompactString),
    NameRef(CompactString),
    ValueRef(CompactString),
    StringLit(CompactString),
    NumberLit(CompactString),
    Cmp(Cmp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn as_str(self) -> &'static str {
        match self {
            Cmp::Eq => "=",
            Cmp::Ne => "<>",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, MtdbError> {
    let malformed = |reason: String| MtdbError::MalformedExpression(reason);
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Cmp(Cmp::Eq));
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Cmp(Cmp::Le));
                    }
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Cmp(Cmp::Ne));
                    }
                    _ => tokens.push(Token::Cmp(Cmp::Lt)),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Cmp(Cmp::Ge));
                } else {
                    tokens.push(Token::Cmp(Cmp::Gt));
                }
            }
            '#' | ':' => {
                let sigil = c;
                chars.next();
                let mut name = CompactString::default();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(malformed(format!("dangling '{sigil}' placeholder")));
                }
                tokens.push(if sigil == '#' {
                    Token::NameRef(name)
                } else {
                    Token::ValueRef(name)
                });
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = CompactString::default();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                        None => return Err(malformed("unterminated string literal".to_string())),
                    }
                }
                tokens.push(Token::StringLit(value));
            }
            c if c.is_ascii_digit() => {
                let mut lexeme = CompactString::default();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                        lexeme.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::NumberLit(lexeme));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = CompactString::default();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(malformed(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// An attribute name as written: a literal identifier or a `#placeholder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameToken {
    Ident(CompactString),
    Ref(CompactString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathElement {
    Attr(NameToken),
    Index(u32),
}

/// A document path: root attribute plus nested access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn root(&self) -> &NameToken {
        match &self.0[0] {
            PathElement::Attr(name) => name,
            PathElement::Index(_) => unreachable!("paths always start with an attribute"),
        }
    }

    fn root_mut(&mut self) -> &mut NameToken {
        match &mut self.0[0] {
            PathElement::Attr(name) => name,
            PathElement::Index(_) => unreachable!("paths always start with an attribute"),
        }
    }

    pub fn is_root_only(&self) -> bool {
        self.0.len() == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Path(Path),
    ValueRef(CompactString),
    StringLit(CompactString),
    NumberLit(CompactString),
    Size(Path),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondExpr {
    Compare(Cmp, Operand, Operand),
    Between(Operand, Operand, Operand),
    In(Operand, Vec<Operand>),
    AttributeExists(Path),
    AttributeNotExists(Path),
    AttributeType(Path, Operand),
    BeginsWith(Path, Operand),
    Contains(Path, Operand),
    And(Box<CondExpr>, Box<CondExpr>),
    Or(Box<CondExpr>, Box<CondExpr>),
    Not(Box<CondExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateValue {
    Operand(Operand),
    Plus(Operand, Operand),
    Minus(Operand, Operand),
    IfNotExists(Path, Operand),
    ListAppend(Operand, Operand),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateExpr {
    pub set: Vec<(Path, UpdateValue)>,
    pub remove: Vec<Path>,
    pub add: Vec<(Path, Operand)>,
    pub delete: Vec<(Path, Operand)>,
}

// ---------------------------------------------------------------------------
// parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, reason: impl Into<String>) -> MtdbError {
        MtdbError::MalformedExpression(reason.into())
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), MtdbError> {
        match self.next() {
            Some(t) if t == *token => Ok(()),
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(ident)) if ident.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // condition grammar

    fn parse_or(&mut self, depth: usize) -> Result<CondExpr, MtdbError> {
        if depth > MAX_EXPR_DEPTH {
            return Err(self.error("expression is nested too deeply"));
        }
        let mut lhs = self.parse_and(depth + 1)?;
        while self.eat_keyword("OR") {
            let rhs = self.parse_and(depth + 1)?;
            lhs = CondExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self, depth: usize) -> Result<CondExpr, MtdbError> {
        if depth > MAX_EXPR_DEPTH {
            return Err(self.error("expression is nested too deeply"));
        }
        let mut lhs = self.parse_not(depth + 1)?;
        while self.eat_keyword("AND") {
            let rhs = self.parse_not(depth + 1)?;
            lhs = CondExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self, depth: usize) -> Result<CondExpr, MtdbError> {
        if depth > MAX_EXPR_DEPTH {
            return Err(self.error("expression is nested too deeply"));
        }
        if self.eat_keyword("NOT") {
            let inner = self.parse_not(depth + 1)?;
            return Ok(CondExpr::Not(Box::new(inner)));
        }
        self.parse_primary(depth + 1)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<CondExpr, MtdbError> {
        if let Some(Token::LParen) = self.peek() {
            self.next();
            let inner = self.parse_or(depth + 1)?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(inner);
        }

        if let Some(Token::Ident(ident)) = self.peek() {
            let name = ident.clone();
            if self.tokens.get(self.pos + 1) == Some(&Token::LParen) && is_condition_fn(&name) {
                return self.parse_function(&name);
            }
        }

        let lhs = self.parse_operand()?;
        if let Some(Token::Cmp(cmp)) = self.peek() {
            let cmp = *cmp;
            self.next();
            let rhs = self.parse_operand()?;
            return Ok(CondExpr::Compare(cmp, lhs, rhs));
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.parse_operand()?;
            if !self.eat_keyword("AND") {
                return Err(self.error("expected AND in BETWEEN"));
            }
            let high = self.parse_operand()?;
            return Ok(CondExpr::Between(lhs, low, high));
        }
        if self.eat_keyword("IN") {
            self.expect(&Token::LParen, "'(' after IN")?;
            let mut members = vec![self.parse_operand()?];
            while self.peek() == Some(&Token::Comma) {
                self.next();
                members.push(self.parse_operand()?);
            }
            self.expect(&Token::RParen, "')' closing IN")?;
            return Ok(CondExpr::In(lhs, members));
        }
        Err(self.error("expected comparator, BETWEEN, or IN after operand"))
    }

    fn parse_function(&mut self, name: &str) -> Result<CondExpr, MtdbError> {
        self.next(); // function name
        self.expect(&Token::LParen, "'('")?;
        let expr = match name {
            "attribute_exists" => CondExpr::AttributeExists(self.parse_path()?),
            "attribute_not_exists" => CondExpr::AttributeNotExists(self.parse_path()?),
            "attribute_type" => {
                let path = self.parse_path()?;
                self.expect(&Token::Comma, "','")?;
                CondExpr::AttributeType(path, self.parse_operand()?)
            }
            "begins_with" => {
                let path = self.parse_path()?;
                self.expect(&Token::Comma, "','")?;
                CondExpr::BeginsWith(path, self.parse_operand()?)
            }
            "contains" => {
                let path = self.parse_path()?;
                self.expect(&Token::Comma, "','")?;
                CondExpr::Contains(path, self.parse_operand()?)
            }
            other => return Err(self.error(format!("unknown function '{other}'"))),
        };
        self.expect(&Token::RParen, "')'")?;
        Ok(expr)
    }

    fn parse_operand(&mut self) -> Result<Operand, MtdbError> {
        match self.peek() {
            Some(Token::ValueRef(name)) => {
                let name = name.clone();
                self.next();
                Ok(Operand::ValueRef(name))
            }
            Some(Token::StringLit(value)) => {
                let value = value.clone();
                self.next();
                Ok(Operand::StringLit(value))
            }
            Some(Token::NumberLit(value)) => {
                let value = value.clone();
                self.next();
                Ok(Operand::NumberLit(value))
            }
            Some(Token::Minus) => {
                self.next();
                match self.next() {
                    Some(Token::NumberLit(value)) => {
                        Ok(Operand::NumberLit(CompactString::from(format!("-{value}"))))
                    }
                    other => Err(self.error(format!("expected number after '-', found {other:?}"))),
                }
            }
            Some(Token::Ident(ident)) if ident == "size" => {
                self.next();
                self.expect(&Token::LParen, "'(' after size")?;
                let path = self.parse_path()?;
                self.expect(&Token::RParen, "')' closing size")?;
                Ok(Operand::Size(path))
            }
            Some(Token::Ident(_) | Token::NameRef(_)) => Ok(Operand::Path(self.parse_path()?)),
            other => Err(self.error(format!("expected operand, found {other:?}"))),
        }
    }

    fn parse_path(&mut self) -> Result<Path, MtdbError> {
        let root = match self.next() {
            Some(Token::Ident(name)) => NameToken::Ident(name),
            Some(Token::NameRef(name)) => NameToken::Ref(name),
            other => return Err(self.error(format!("expected attribute name, found {other:?}"))),
        };
        let mut elements = vec![PathElement::Attr(root)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(name)) => {
                            elements.push(PathElement::Attr(NameToken::Ident(name)));
                        }
                        Some(Token::NameRef(name)) => {
                            elements.push(PathElement::Attr(NameToken::Ref(name)));
                        }
                        other => {
                            return Err(
                                self.error(format!("expected name after '.', found {other:?}"))
                            );
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = match self.next() {
                        Some(Token::NumberLit(lexeme)) => lexeme
                            .parse::<u32>()
                            .map_err(|_| self.error(format!("bad list index '{lexeme}'")))?,
                        other => {
                            return Err(
                                self.error(format!("expected list index, found {other:?}"))
                            );
                        }
                    };
                    self.expect(&Token::RBracket, "']'")?;
                    elements.push(PathElement::Index(index));
                }
                _ => break,
            }
        }
        Ok(Path(elements))
    }

    // update grammar

    fn parse_update(&mut self) -> Result<UpdateExpr, MtdbError> {
        let mut update = UpdateExpr::default();
        while !self.at_end() {
            if self.eat_keyword("SET") {
                loop {
                    let path = self.parse_path()?;
                    self.expect(&Token::Cmp(Cmp::Eq), "'=' in SET action")?;
                    let value = self.parse_update_value()?;
                    update.set.push((path, value));
                    if self.peek() == Some(&Token::Comma) {
                        self.next();
                    } else {
                        break;
                    }
                }
            } else if self.eat_keyword("REMOVE") {
                loop {
                    update.remove.push(self.parse_path()?);
                    if self.peek() == Some(&Token::Comma) {
                        self.next();
                    } else {
                        break;
                    }
                }
            } else if self.eat_keyword("ADD") {
                loop {
                    let path = self.parse_path()?;
                    let value = self.parse_operand()?;
                    update.add.push((path, value));
                    if self.peek() == Some(&Token::Comma) {
                        self.next();
                    } else {
                        break;
                    }
                }
            } else if self.eat_keyword("DELETE") {
                loop {
                    let path = self.parse_path()?;
                    let value = self.parse_operand()?;
                    update.delete.push((path, value));
                    if self.peek() == Some(&Token::Comma) {
                        self.next();
                    } else {
                        break;
                    }
                }
            } else {
                return Err(self.error(format!(
                    "expected SET, REMOVE, ADD, or DELETE, found {:?}",
                    self.peek()
                )));
            }
        }
        if update.set.is_empty()
            && update.remove.is_empty()
            && update.add.is_empty()
            && update.delete.is_empty()
        {
            return Err(self.error("empty update expression"));
        }
        Ok(update)
    }

    fn parse_update_value(&mut self) -> Result<UpdateValue, MtdbError> {
        if let Some(Token::Ident(ident)) = self.peek() {
            let name = ident.clone();
            if self.tokens.get(self.pos + 1) == Some(&Token::LParen)
                && (name == "if_not_exists" || name == "list_append")
            {
                self.next();
                self.expect(&Token::LParen, "'('")?;
                let value = if name == "if_not_exists" {
                    let path = self.parse_path()?;
                    self.expect(&Token::Comma, "','")?;
                    let fallback = self.parse_operand()?;
                    UpdateValue::IfNotExists(path, fallback)
                } else {
                    let first = self.parse_operand()?;
                    self.expect(&Token::Comma, "','")?;
                    let second = self.parse_operand()?;
                    UpdateValue::ListAppend(first, second)
                };
                self.expect(&Token::RParen, "')'")?;
                return Ok(value);
            }
        }
        let first = self.parse_operand()?;
        match self.peek() {
            Some(Token::Plus) => {
                self.next();
                Ok(UpdateValue::Plus(first, self.parse_operand()?))
            }
            Some(Token::Minus) => {
                self.next();
                Ok(UpdateValue::Minus(first, self.parse_operand()?))
            }
            _ => Ok(UpdateValue::Operand(first)),
        }
    }

    // projection grammar

    fn parse_projection(&mut self) -> Result<Vec<Path>, MtdbError> {
        let mut paths = vec![self.parse_path()?];
        while self.peek() == Some(&Token::Comma) {
            self.next();
            paths.push(self.parse_path()?);
        }
        Ok(paths)
    }
}

fn is_condition_fn(name: &str) -> bool {
    matches!(
        name,
        "attribute_exists" | "attribute_not_exists" | "attribute_type" | "begins_with" | "contains"
    )
}

fn parse_cached(class: u8, text: &str) -> Result<Arc<Parsed>, MtdbError> {
    let cache_key = (class, text.to_string());
    let shard = &PARSE_CACHE[parse_cache_shard_idx(&cache_key)];
    if let Some(parsed) = shard.lock().get(&cache_key) {
        return Ok(Arc::clone(parsed));
    }

    let mut parser = Parser::new(tokenize(text)?);
    let parsed = match class {
        0 => {
            let expr = parser.parse_or(0)?;
            if !parser.at_end() {
                return Err(parser.error("trailing tokens after expression"));
            }
            Parsed::Cond(expr)
        }
        1 => Parsed::Update(parser.parse_update()?),
        _ => {
            let paths = parser.parse_projection()?;
            if !parser.at_end() {
                return Err(parser.error("trailing tokens after projection"));
            }
            Parsed::Projection(paths)
        }
    };
    let parsed = Arc::new(parsed);
    shard.lock().put(cache_key, Arc::clone(&parsed));
    Ok(parsed)
}

pub fn parse_condition(text: &str) -> Result<CondExpr, MtdbError> {
    match parse_cached(0, text)?.as_ref() {
        Parsed::Cond(expr) => Ok(expr.clone()),
        _ => unreachable!(),
    }
}

pub fn parse_update(text: &str) -> Result<UpdateExpr, MtdbError> {
    match parse_cached(1, text)?.as_ref() {
        Parsed::Update(expr) => Ok(expr.clone()),
        _ => unreachable!(),
    }
}

pub fn parse_projection(text: &str) -> Result<Vec<Path>, MtdbError> {
    match parse_cached(2, text)?.as_ref() {
        Parsed::Projection(paths) => Ok(paths.clone()),
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------------
// rendering
// ---------------------------------------------------------------------------

impl NameToken {
    fn render(&self, out: &mut String) {
        match self {
            NameToken::Ident(name) => out.push_str(name),
            NameToken::Ref(name) => {
                out.push('#');
                out.push_str(name);
            }
        }
    }
}

impl Path {
    fn render(&self, out: &mut String) {
        for (i, element) in self.0.iter().enumerate() {
            match element {
                PathElement::Attr(name) => {
                    if i > 0 {
                        out.push('.');
                    }
                    name.render(out);
                }
                PathElement::Index(index) => {
                    out.push('[');
                    out.push_str(&index.to_string());
                    out.push(']');
                }
            }
        }
    }
}

impl Operand {
    fn render(&self, out: &mut String) {
        match self {
            Operand::Path(path) => path.render(out),
            Operand::ValueRef(name) => {
                out.push(':');
                out.push_str(name);
            }
            Operand::StringLit(value) => {
                out.push('\'');
                out.push_str(value);
                out.push('\'');
            }
            Operand::NumberLit(value) => out.push_str(value),
            Operand::Size(path) => {
                out.push_str("size(");
                path.render(out);
                out.push(')');
            }
        }
    }
}

impl CondExpr {
    fn render(&self, out: &mut String) {
        match self {
            CondExpr::Compare(cmp, lhs, rhs) => {
                lhs.render(out);
                out.push(' ');
                out.push_str(cmp.as_str());
                out.push(' ');
                rhs.render(out);
            }
            CondExpr::Between(subject, low, high) => {
                subject.render(out);
                out.push_str(" BETWEEN ");
                low.render(out);
                out.push_str(" AND ");
                high.render(out);
            }
            CondExpr::In(subject, members) => {
                subject.render(out);
                out.push_str(" IN (");
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    member.render(out);
                }
                out.push(')');
            }
            CondExpr::AttributeExists(path) => {
                out.push_str("attribute_exists(");
                path.render(out);
                out.push(')');
            }
            CondExpr::AttributeNotExists(path) => {
                out.push_str("attribute_not_exists(");
                path.render(out);
                out.push(')');
            }
            CondExpr::AttributeType(path, operand) => {
                out.push_str("attribute_type(");
                path.render(out);
                out.push_str(", ");
                operand.render(out);
                out.push(')');
            }
            CondExpr::BeginsWith(path, operand) => {
                out.push_str("begins_with(");
                path.render(out);
                out.push_str(", ");
                operand.render(out);
                out.push(')');
            }
            CondExpr::Contains(path, operand) => {
                out.push_str("contains(");
                path.render(out);
                out.push_str(", ");
                operand.render(out);
                out.push(')');
            }
            CondExpr::And(lhs, rhs) => {
                render_grouped(lhs, out);
                out.push_str(" AND ");
                render_grouped(rhs, out);
            }
            CondExpr::Or(lhs, rhs) => {
                render_grouped(lhs, out);
                out.push_str(" OR ");
                render_grouped(rhs, out);
            }
            CondExpr::Not(inner) => {
                out.push_str("NOT ");
                render_grouped(inner, out);
            }
        }
    }
}

fn render_grouped(expr: &CondExpr, out: &mut String) {
    if matches!(
        expr,
        CondExpr::And(_, _) | CondExpr::Or(_, _) | CondExpr::Not(_)
    ) {
        out.push('(');
        expr.render(out);
        out.push(')');
    } else {
        expr.render(out);
    }
}

impl UpdateValue {
    fn render(&self, out: &mut String) {
        match self {
            UpdateValue::Operand(operand) => operand.render(out),
            UpdateValue::Plus(lhs, rhs) => {
                lhs.render(out);
                out.push_str(" + ");
                rhs.render(out);
            }
            UpdateValue::Minus(lhs, rhs) => {
                lhs.render(out);
                out.push_str(" - ");
                rhs.render(out);
            }
            UpdateValue::IfNotExists(path, fallback) => {
                out.push_str("if_not_exists(");
                path.render(out);
                out.push_str(", ");
                fallback.render(out);
                out.push(')');
            }
            UpdateValue::ListAppend(lhs, rhs) => {
                out.push_str("list_append(");
                lhs.render(out);
                out.push_str(", ");
                rhs.render(out);
                out.push(')');
            }
        }
    }
}

impl UpdateExpr {
    fn render(&self, out: &mut String) {
        let mut wrote = false;
        if !self.set.is_empty() {
            out.push_str("SET ");
            for (i, (path, value)) in self.set.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                path.render(out);
                out.push_str(" = ");
                value.render(out);
            }
            wrote = true;
        }
        if !self.remove.is_empty() {
            if wrote {
                out.push(' ');
            }
            out.push_str("REMOVE ");
            for (i, path) in self.remove.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                path.render(out);
            }
            wrote = true;
        }
        if !self.add.is_empty() {
            if wrote {
                out.push(' ');
            }
            out.push_str("ADD ");
            for (i, (path, value)) in self.add.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                path.render(out);
                out.push(' ');
                value.render(out);
            }
            wrote = true;
        }
        if !self.delete.is_empty() {
            if wrote {
                out.push(' ');
            }
            out.push_str("DELETE ");
            for (i, (path, value)) in self.delete.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                path.render(out);
                out.push(' ');
                value.render(out);
            }
        }
    }
}

impl fmt::Display for CondExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut out);
        f.write_str(&out)
    }
}

impl fmt::Display for UpdateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut out);
        f.write_str(&out)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut out);
        f.write_str(&out)
    }
}

// ---------------------------------------------------------------------------
// rewriting
// ---------------------------------------------------------------------------

/// Which part of a key schema a mapped field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    PrimaryHash,
    PrimaryRange,
    IndexHash,
    IndexRange,
}

/// Rewrite-relevant view of one mapped key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedField {
    pub physical_name: CompactString,
    pub virtual_type: KeyType,
    pub part: KeyPart,
    /// True when the physical value is the tenant-qualified composite and
    /// comparisons against this field must encode their value side.
    pub encodes_composite: bool,
}

/// Everything the rewriter needs from a table mapping.
pub struct RewriteContext<'a> {
    pub fields: &'a BTreeMap<CompactString, KeyedField>,
    pub codec: &'a KeyCodec,
    pub tenant_id: &'a str,
    pub table_name: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenExpression {
    pub text: String,
    pub names: Option<NameMap>,
    pub values: Option<ValueMap>,
    /// Set when the whole expression was proved constant against any stored
    /// row (`attribute_exists` / `attribute_not_exists` on the hash key).
    pub proved: Option<bool>,
}

struct Rewriter<'a> {
    ctx: &'a RewriteContext<'a>,
    input_names: Option<&'a NameMap>,
    input_values: Option<&'a ValueMap>,
    out_names: NameMap,
    out_values: ValueMap,
    names_extended: bool,
    values_extended: bool,
    name_aliases: BTreeMap<CompactString, CompactString>,
    value_aliases: BTreeMap<CompactString, CompactString>,
    counter: usize,
}

impl<'a> Rewriter<'a> {
    fn new(
        ctx: &'a RewriteContext<'a>,
        names: Option<&'a NameMap>,
        values: Option<&'a ValueMap>,
    ) -> Self {
        Self {
            ctx,
            input_names: names,
            input_values: values,
            out_names: names.cloned().unwrap_or_default(),
            out_values: values.cloned().unwrap_or_default(),
            names_extended: false,
            values_extended: false,
            name_aliases: BTreeMap::new(),
            value_aliases: BTreeMap::new(),
            counter: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> MtdbError {
        MtdbError::MalformedExpression(reason.into())
    }

    fn resolve_name(&self, token: &NameToken) -> Result<CompactString, MtdbError> {
        match token {
            NameToken::Ident(name) => Ok(name.clone()),
            NameToken::Ref(name) => self
                .input_names
                .and_then(|names| names.get(format!("#{name}").as_str()))
                .cloned()
                .ok_or_else(|| self.error(format!("unresolved name placeholder '#{name}'"))),
        }
    }

    /// The field mapping a path resolves to, if any. Nested paths cannot
    /// name a key attribute, so only root-only paths match.
    fn field_for(&self, path: &Path) -> Result<Option<&'a KeyedField>, MtdbError> {
        if !path.is_root_only() {
            return Ok(None);
        }
        let resolved = self.resolve_name(path.root())?;
        Ok(self.ctx.fields.get(resolved.as_str()))
    }

    fn alias_for(&mut self, physical_name: &str) -> CompactString {
        if let Some(alias) = self.name_aliases.get(physical_name) {
            return alias.clone();
        }
        let alias = loop {
            let candidate = CompactString::from(format!("#mt{}", self.counter));
            self.counter += 1;
            if !self.out_names.contains_key(candidate.as_str()) {
                break candidate;
            }
        };
        self.out_names
            .insert(alias.clone(), CompactString::from(physical_name));
        self.names_extended = true;
        self.name_aliases
            .insert(CompactString::from(physical_name), alias.clone());
        alias
    }

    fn substitute_path(&mut self, path: &mut Path) -> Result<Option<&'a KeyedField>, MtdbError> {
        let field = self.field_for(path)?;
        if let Some(field) = field {
            let alias = self.alias_for(&field.physical_name);
            *path.root_mut() = NameToken::Ref(alias.trim_start_matches('#').into());
        }
        Ok(field)
    }

    fn resolve_operand_value(&self, operand: &Operand) -> Result<AttributeValue, MtdbError> {
        match operand {
            Operand::ValueRef(name) => self
                .input_values
                .and_then(|values| values.get(format!(":{name}").as_str()))
                .cloned()
                .ok_or_else(|| self.error(format!("unresolved value placeholder ':{name}'"))),
            Operand::StringLit(value) => Ok(AttributeValue::s(value.clone())),
            Operand::NumberLit(value) => Ok(AttributeValue::n(value.clone())),
            other => Err(self.error(format!("operand {other:?} has no static value"))),
        }
    }

    /// Replaces an operand compared against a composite hash field with a
    /// placeholder bound to the encoded value. The same source placeholder
    /// is reused across occurrences since it always encodes identically.
    fn encode_value_operand(&mut self, operand: &mut Operand) -> Result<(), MtdbError> {
        let source_ref = match operand {
            Operand::ValueRef(name) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = &source_ref
            && let Some(alias) = self.value_aliases.get(name.as_str())
        {
            *operand = Operand::ValueRef(alias.clone());
            return Ok(());
        }

        let value = self.resolve_operand_value(operand)?;
        let encoded = AttributeValue::S(self.ctx.codec.encode(
            self.ctx.tenant_id,
            self.ctx.table_name,
            &value,
        )?);

        let alias = loop {
            let candidate = CompactString::from(format!("mt{}", self.counter));
            self.counter += 1;
            if !self
                .out_values
                .contains_key(format!(":{candidate}").as_str())
            {
                break candidate;
            }
        };
        self.out_values
            .insert(CompactString::from(format!(":{alias}")), encoded);
        self.values_extended = true;
        if let Some(name) = source_ref {
            self.value_aliases.insert(name, alias.clone());
        }
        *operand = Operand::ValueRef(alias);
        Ok(())
    }

    fn encode_prefix_operand(&mut self, operand: &mut Operand) -> Result<(), MtdbError> {
        let value = self.resolve_operand_value(operand)?;
        let partial = match &value {
            AttributeValue::S(s) => s.clone(),
            other => canonical_text(other)?,
        };
        let mut prefixed = self
            .ctx
            .codec
            .encode_prefix(self.ctx.tenant_id, self.ctx.table_name);
        prefixed.push_str(&escape_segment(&partial, self.ctx.codec.delimiter()));

        let alias = loop {
            let candidate = CompactString::from(format!("mt{}", self.counter));
            self.counter += 1;
            if !self
                .out_values
                .contains_key(format!(":{candidate}").as_str())
            {
                break candidate;
            }
        };
        self.out_values.insert(
            CompactString::from(format!(":{alias}")),
            AttributeValue::S(prefixed),
        );
        self.values_extended = true;
        *operand = Operand::ValueRef(alias);
        Ok(())
    }

    fn rewrite_operand(&mut self, operand: &mut Operand) -> Result<Option<&'a KeyedField>, MtdbError> {
        match operand {
            Operand::Path(path) => self.substitute_path(path),
            Operand::Size(path) => {
                let field = self.substitute_path(path)?;
                if field.is_some_and(|f| f.encodes_composite) {
                    return Err(MtdbError::UnsupportedPredicate(
                        "size() of the hash key is not supported".to_string(),
                    ));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn rewrite_cond(&mut self, expr: &mut CondExpr) -> Result<(), MtdbError> {
        match expr {
            CondExpr::Compare(cmp, lhs, rhs) => {
                let lhs_field = self.rewrite_operand(lhs)?;
                let rhs_field = self.rewrite_operand(rhs)?;
                let composite = match (lhs_field, rhs_field) {
                    (Some(f), None) if f.encodes_composite => Some((f, rhs)),
                    (None, Some(f)) if f.encodes_composite => Some((f, lhs)),
                    (Some(a), Some(b)) if a.encodes_composite || b.encodes_composite => {
                        return Err(MtdbError::UnsupportedPredicate(
                            "hash key cannot be compared to another attribute".to_string(),
                        ));
                    }
                    _ => None,
                };
                if let Some((_, value_side)) = composite {
                    if *cmp != Cmp::Eq {
                        return Err(MtdbError::UnsupportedPredicate(format!(
                            "only equality comparisons are supported on the hash key, got '{}'",
                            cmp.as_str()
                        )));
                    }
                    self.encode_value_operand(value_side)?;
                }
                Ok(())
            }
            CondExpr::Between(subject, low, high) => {
                let field = self.rewrite_operand(subject)?;
                if field.is_some_and(|f| f.encodes_composite) {
                    return Err(MtdbError::UnsupportedPredicate(
                        "BETWEEN on the hash key is not supported".to_string(),
                    ));
                }
                self.rewrite_operand(low)?;
                self.rewrite_operand(high)?;
                Ok(())
            }
            CondExpr::In(subject, members) => {
                let field = self.rewrite_operand(subject)?;
                if let Some(field) = field
                    && field.encodes_composite
                {
                    for member in members.iter_mut() {
                        self.encode_value_operand(member)?;
                    }
                    return Ok(());
                }
                for member in members.iter_mut() {
                    self.rewrite_operand(member)?;
                }
                Ok(())
            }
            CondExpr::AttributeExists(path) | CondExpr::AttributeNotExists(path) => {
                self.substitute_path(path)?;
                Ok(())
            }
            CondExpr::AttributeType(path, operand) => {
                let field = self.field_for(path)?.cloned();
                self.substitute_path(path)?;
                match field {
                    Some(field) if field.encodes_composite => {
                        // The physical value is always a string; the check is
                        // decided by the virtual key type instead.
                        let tag = self.resolve_operand_value(operand)?;
                        let tag = tag.as_s().ok_or_else(|| {
                            self.error("attribute_type expects a string type tag")
                        })?;
                        let substituted = path.clone();
                        *expr = if tag == field.virtual_type.as_str() {
                            CondExpr::AttributeExists(substituted)
                        } else {
                            CondExpr::AttributeNotExists(substituted)
                        };
                        Ok(())
                    }
                    _ => {
                        self.rewrite_operand(operand)?;
                        Ok(())
                    }
                }
            }
            CondExpr::BeginsWith(path, operand) => {
                let field = self.field_for(path)?.cloned();
                self.substitute_path(path)?;
                if field.is_some_and(|f| f.encodes_composite) {
                    self.encode_prefix_operand(operand)?;
                } else {
                    self.rewrite_operand(operand)?;
                }
                Ok(())
            }
            CondExpr::Contains(path, operand) => {
                let field = self.substitute_path(path)?;
                if field.is_some_and(|f| f.encodes_composite) {
                    return Err(MtdbError::UnsupportedPredicate(
                        "contains() on the hash key is not supported".to_string(),
                    ));
                }
                self.rewrite_operand(operand)?;
                Ok(())
            }
            CondExpr::And(lhs, rhs) | CondExpr::Or(lhs, rhs) => {
                self.rewrite_cond(lhs)?;
                self.rewrite_cond(rhs)
            }
            CondExpr::Not(inner) => self.rewrite_cond(inner),
        }
    }

    fn rewrite_update(&mut self, expr: &mut UpdateExpr) -> Result<(), MtdbError> {
        for (path, value) in expr.set.iter_mut() {
            self.check_updatable(path)?;
            self.substitute_path(path)?;
            self.rewrite_update_value(value)?;
        }
        for path in expr.remove.iter_mut() {
            self.check_updatable(path)?;
            self.substitute_path(path)?;
        }
        for (path, operand) in expr.add.iter_mut().chain(expr.delete.iter_mut()) {
            self.check_updatable(path)?;
            self.substitute_path(path)?;
            self.rewrite_value_source(operand)?;
        }
        Ok(())
    }

    fn check_updatable(&self, path: &Path) -> Result<(), MtdbError> {
        let Some(field) = self.field_for(path)? else {
            return Ok(());
        };
        match field.part {
            KeyPart::PrimaryHash | KeyPart::PrimaryRange => {
                Err(MtdbError::UnsupportedOperation(format!(
                    "key attribute '{}' cannot be updated",
                    path.root_name()
                )))
            }
            KeyPart::IndexHash => Err(MtdbError::UnsupportedOperation(format!(
                "updates on index hash key '{}' are unsupported",
                path.root_name()
            ))),
            KeyPart::IndexRange => Ok(()),
        }
    }

    fn rewrite_update_value(&mut self, value: &mut UpdateValue) -> Result<(), MtdbError> {
        match value {
            UpdateValue::Operand(operand) => self.rewrite_value_source(operand),
            UpdateValue::Plus(lhs, rhs) | UpdateValue::Minus(lhs, rhs) => {
                self.rewrite_value_source(lhs)?;
                self.rewrite_value_source(rhs)
            }
            UpdateValue::IfNotExists(path, fallback) => {
                let field = self.substitute_path(path)?;
                if field.is_some_and(|f| f.encodes_composite) {
                    return Err(MtdbError::UnsupportedOperation(
                        "hash key cannot be read inside an update value".to_string(),
                    ));
                }
                self.rewrite_value_source(fallback)
            }
            UpdateValue::ListAppend(lhs, rhs) => {
                self.rewrite_value_source(lhs)?;
                self.rewrite_value_source(rhs)
            }
        }
    }

    /// Operands used as value sources. A composite-encoded field cannot be
    /// copied into another attribute without leaking the physical encoding.
    fn rewrite_value_source(&mut self, operand: &mut Operand) -> Result<(), MtdbError> {
        let field = self.rewrite_operand(operand)?;
        if field.is_some_and(|f| f.encodes_composite) {
            return Err(MtdbError::UnsupportedOperation(
                "hash key cannot be read inside an update value".to_string(),
            ));
        }
        Ok(())
    }

    fn rewrite_projection(&mut self, paths: &mut [Path]) -> Result<(), MtdbError> {
        for path in paths.iter_mut() {
            self.substitute_path(path)?;
        }
        Ok(())
    }

    fn into_output(self, text: String, proved: Option<bool>) -> RewrittenExpression {
        let names = if self.names_extended || self.input_names.is_some() {
            Some(self.out_names)
        } else {
            None
        };
        let values = if self.values_extended || self.input_values.is_some() {
            Some(self.out_values)
        } else {
            None
        };
        RewrittenExpression {
            text,
            names,
            values,
            proved,
        }
    }
}

impl Path {
    fn root_name(&self) -> String {
        let mut out = String::new();
        self.root().render(&mut out);
        out
    }
}

/// Rewrites one expression for the given role: substitutes physical field
/// names for mapped virtual key attributes, encodes values compared against
/// composite hash keys, and leaves every other token untouched.
pub fn rewrite(
    ctx: &RewriteContext<'_>,
    role: ExpressionRole,
    text: &str,
    names: Option<&NameMap>,
    values: Option<&ValueMap>,
) -> Result<RewrittenExpression, MtdbError> {
    let mut rewriter = Rewriter::new(ctx, names, values);
    match role {
        ExpressionRole::Condition | ExpressionRole::Filter => {
            let original = parse_condition(text)?;
            let mut expr = original.clone();
            rewriter.rewrite_cond(&mut expr)?;
            let proved = match (&expr, &original) {
                (CondExpr::AttributeExists(_), CondExpr::AttributeExists(path))
                    if is_primary_hash(&rewriter, path)? =>
                {
                    Some(true)
                }
                (CondExpr::AttributeNotExists(_), CondExpr::AttributeNotExists(path))
                    if is_primary_hash(&rewriter, path)? =>
                {
                    Some(false)
                }
                // attribute_type over the hash key reduces to exists checks.
                (CondExpr::AttributeExists(_), CondExpr::AttributeType(path, _))
                    if is_primary_hash(&rewriter, path)? =>
                {
                    Some(true)
                }
                (CondExpr::AttributeNotExists(_), CondExpr::AttributeType(path, _))
                    if is_primary_hash(&rewriter, path)? =>
                {
                    Some(false)
                }
                _ => None,
            };
            let mut out = String::new();
            expr.render(&mut out);
            Ok(rewriter.into_output(out, proved))
        }
        ExpressionRole::KeyCondition => {
            let mut expr = parse_condition(text)?;
            validate_key_condition(&expr, &rewriter)?;
            rewriter.rewrite_cond(&mut expr)?;
            let mut out = String::new();
            expr.render(&mut out);
            Ok(rewriter.into_output(out, None))
        }
        ExpressionRole::Projection => {
            let mut paths = parse_projection(text)?;
            rewriter.rewrite_projection(&mut paths)?;
            let mut out = String::new();
            for (i, path) in paths.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                path.render(&mut out);
            }
            Ok(rewriter.into_output(out, None))
        }
        ExpressionRole::Update => {
            let mut expr = parse_update(text)?;
            rewriter.rewrite_update(&mut expr)?;
            let mut out = String::new();
            expr.render(&mut out);
            Ok(rewriter.into_output(out, None))
        }
    }
}

fn is_primary_hash(rewriter: &Rewriter<'_>, path: &Path) -> Result<bool, MtdbError> {
    Ok(rewriter
        .field_for(path)?
        .is_some_and(|field| field.part == KeyPart::PrimaryHash))
}

/// Key condition expressions are structurally restricted: AND-combined
/// predicates taking equality only, plus `begins_with` on a range key.
/// Greater-than is available solely through the structured key-conditions
/// map.
fn validate_key_condition(expr: &CondExpr, rewriter: &Rewriter<'_>) -> Result<(), MtdbError> {
    match expr {
        CondExpr::And(lhs, rhs) => {
            validate_key_condition(lhs, rewriter)?;
            validate_key_condition(rhs, rewriter)
        }
        CondExpr::Compare(cmp, _, _) => match cmp {
            Cmp::Eq => Ok(()),
            other => Err(MtdbError::UnsupportedPredicate(format!(
                "comparison '{}' is not supported in key condition expressions; \
                 greater-than is only available through the key-conditions map",
                other.as_str()
            ))),
        },
        CondExpr::BeginsWith(path, _) => {
            let hash_subject = rewriter
                .field_for(path)
                .ok()
                .flatten()
                .is_some_and(|f| matches!(f.part, KeyPart::PrimaryHash | KeyPart::IndexHash));
            if hash_subject {
                Err(MtdbError::UnsupportedPredicate(
                    "begins_with on the hash key is not supported in key conditions".to_string(),
                ))
            } else {
                Ok(())
            }
        }
        other => Err(MtdbError::UnsupportedPredicate(format!(
            "predicate {other:?} is not supported in key conditions"
        ))),
    }
}
