//! Rule engine: compiles a router's match expression into a predicate tree.
//!
//! The grammar is small:
//!
//! ```text
//! expr  := and ( "||" and )*
//! and   := unary ( "&&" unary )*
//! unary := "!" unary | "(" expr ")" | call
//! call  := Ident "(" string ( "," string )* ")"
//! ```
//!
//! Strings are quoted with backticks or double quotes. `&&` binds tighter
//! than `||`. Matchers available to HTTP routers are `Host`, `Path`,
//! `PathPrefix`, `PathRegexp`, `Header`, `Method` and `ClientIP`; TCP routers
//! use `HostSNI` and `ClientIP`.
//!
//! A compiled rule is immutable and evaluated without synchronization.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use axum::extract::ConnectInfo;
use hyper::{
    Method, Request,
    header::{HOST, HeaderName, HeaderValue},
};
use ipnetwork::IpNetwork;
use regex::Regex;

use crate::core::error::ConfigError;

/// Which family of routers a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Http,
    Tcp,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Http => f.write_str("HTTP"),
            RuleKind::Tcp => f.write_str("TCP"),
        }
    }
}

/// What a rule can observe about the thing being routed.
pub trait MatchContext {
    fn host(&self) -> Option<&str> {
        None
    }
    fn path(&self) -> Option<&str> {
        None
    }
    fn method(&self) -> Option<&Method> {
        None
    }
    fn header(&self, _name: &HeaderName) -> Option<&HeaderValue> {
        None
    }
    fn client_ip(&self) -> Option<IpAddr> {
        None
    }
    fn server_name(&self) -> Option<&str> {
        None
    }
}

impl<B> MatchContext for Request<B> {
    fn host(&self) -> Option<&str> {
        let raw = self
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri().authority().map(|a| a.as_str()))?;
        Some(strip_port(raw))
    }

    fn path(&self) -> Option<&str> {
        Some(self.uri().path())
    }

    fn method(&self) -> Option<&Method> {
        Some(Request::method(self))
    }

    fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers().get(name)
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    }
}

/// What a TCP rule sees: the SNI (if the client sent a ClientHello) and the peer.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta<'a> {
    pub server_name: Option<&'a str>,
    pub peer: SocketAddr,
}

impl MatchContext for ConnectionMeta<'_> {
    fn client_ip(&self) -> Option<IpAddr> {
        Some(self.peer.ip())
    }

    fn server_name(&self) -> Option<&str> {
        self.server_name
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// A host or SNI pattern: exact name, single-label wildcard or catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// Stored as the suffix including the leading dot, e.g. `.example.com`.
    Wildcard(String),
    Any,
}

impl HostPattern {
    fn parse(raw: &str, allow_any: bool) -> Result<Self, String> {
        let value = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if value.is_empty() {
            return Err("empty host name".to_string());
        }
        if value == "*" {
            return if allow_any {
                Ok(HostPattern::Any)
            } else {
                Err("a bare `*` is only valid in HostSNI".to_string())
            };
        }
        if let Some(suffix) = value.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(format!("invalid wildcard host `{raw}`"));
            }
            return Ok(HostPattern::Wildcard(format!(".{suffix}")));
        }
        if value.contains('*') {
            return Err(format!(
                "wildcards are only allowed as the leftmost label, got `{raw}`"
            ));
        }
        Ok(HostPattern::Exact(value))
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        match self {
            HostPattern::Exact(name) => host.eq_ignore_ascii_case(name),
            HostPattern::Wildcard(suffix) => {
                if host.len() <= suffix.len() {
                    return false;
                }
                let split = host.len() - suffix.len();
                let (label, tail) = host.as_bytes().split_at(split);
                tail.eq_ignore_ascii_case(suffix.as_bytes()) && !label.contains(&b'.')
            }
            HostPattern::Any => true,
        }
    }

    fn score(&self) -> (u8, usize) {
        match self {
            HostPattern::Exact(name) => (2, name.len()),
            HostPattern::Wildcard(suffix) => (1, suffix.len()),
            HostPattern::Any => (0, 0),
        }
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    Host(Vec<HostPattern>),
    HostSni(Vec<HostPattern>),
    Path(Vec<String>),
    PathPrefix(Vec<String>),
    PathRegexp(Vec<Regex>),
    Header {
        name: HeaderName,
        value: Option<String>,
    },
    Method(Vec<Method>),
    ClientIp(Vec<IpNetwork>),
}

impl Predicate {
    fn eval<C: MatchContext + ?Sized>(&self, ctx: &C) -> bool {
        match self {
            Predicate::Host(patterns) => ctx
                .host()
                .is_some_and(|host| patterns.iter().any(|p| p.matches(host))),
            Predicate::HostSni(patterns) => patterns.iter().any(|p| match p {
                HostPattern::Any => true,
                _ => ctx.server_name().is_some_and(|name| p.matches(name)),
            }),
            Predicate::Path(paths) => ctx
                .path()
                .is_some_and(|path| paths.iter().any(|p| p == path)),
            Predicate::PathPrefix(prefixes) => ctx
                .path()
                .is_some_and(|path| prefixes.iter().any(|p| path.starts_with(p.as_str()))),
            Predicate::PathRegexp(patterns) => ctx
                .path()
                .is_some_and(|path| patterns.iter().any(|re| re.is_match(path))),
            Predicate::Header { name, value } => match ctx.header(name) {
                Some(actual) => value
                    .as_ref()
                    .is_none_or(|expected| actual.as_bytes() == expected.as_bytes()),
                None => false,
            },
            Predicate::Method(methods) => ctx.method().is_some_and(|m| methods.contains(m)),
            Predicate::ClientIp(networks) => ctx.client_ip().is_some_and(|ip| {
                let ip = ip.to_canonical();
                networks.iter().any(|net| net.contains(ip))
            }),
        }
    }

    fn specificity(&self) -> Specificity {
        let mut spec = Specificity {
            predicates: 1,
            ..Specificity::default()
        };
        match self {
            Predicate::Host(patterns) | Predicate::HostSni(patterns) => {
                spec.host = patterns
                    .iter()
                    .map(HostPattern::score)
                    .min()
                    .unwrap_or_default();
            }
            Predicate::Path(paths) => {
                spec.path = (3, paths.iter().map(String::len).min().unwrap_or(0));
            }
            Predicate::PathPrefix(prefixes) => {
                spec.path = (2, prefixes.iter().map(String::len).min().unwrap_or(0));
            }
            Predicate::PathRegexp(_) => spec.path = (1, 0),
            Predicate::Header { .. } | Predicate::Method(_) | Predicate::ClientIp(_) => {}
        }
        spec
    }
}

#[derive(Debug, Clone)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Match(Predicate),
}

impl Expr {
    fn eval<C: MatchContext + ?Sized>(&self, ctx: &C) -> bool {
        match self {
            Expr::And(terms) => terms.iter().all(|t| t.eval(ctx)),
            Expr::Or(terms) => terms.iter().any(|t| t.eval(ctx)),
            Expr::Not(inner) => !inner.eval(ctx),
            Expr::Match(predicate) => predicate.eval(ctx),
        }
    }

    fn specificity(&self) -> Specificity {
        match self {
            Expr::And(terms) => terms
                .iter()
                .map(Expr::specificity)
                .fold(Specificity::default(), Specificity::both),
            Expr::Or(terms) => terms
                .iter()
                .map(Expr::specificity)
                .reduce(Specificity::either)
                .unwrap_or_default(),
            Expr::Not(_) => Specificity::default(),
            Expr::Match(predicate) => predicate.specificity(),
        }
    }

    fn any_predicate(&self, f: &impl Fn(&Predicate) -> bool) -> bool {
        match self {
            Expr::And(terms) | Expr::Or(terms) => terms.iter().any(|t| t.any_predicate(f)),
            Expr::Not(inner) => inner.any_predicate(f),
            Expr::Match(predicate) => f(predicate),
        }
    }
}

/// How specific a rule is, compared lexicographically: path first, then
/// host, then the number of predicates. Exact paths rank above prefixes and
/// longer prefixes above shorter ones; exact hosts rank above wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    path: (u8, usize),
    host: (u8, usize),
    predicates: usize,
}

impl Specificity {
    // Every conjunct must hold, so the most specific one counts.
    fn both(self, other: Self) -> Self {
        Self {
            path: self.path.max(other.path),
            host: self.host.max(other.host),
            predicates: self.predicates + other.predicates,
        }
    }

    // Only one alternative has to hold, so the least specific one counts.
    fn either(self, other: Self) -> Self {
        Self {
            path: self.path.min(other.path),
            host: self.host.min(other.host),
            predicates: self.predicates.min(other.predicates),
        }
    }
}

/// A parsed, validated match expression.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    source: String,
    expr: Expr,
    specificity: Specificity,
}

impl CompiledRule {
    pub fn parse(source: &str, kind: RuleKind) -> Result<Self, ConfigError> {
        let syntax_error = |reason: String| ConfigError::RuleSyntax {
            rule: source.to_string(),
            reason,
        };
        let tokens = tokenize(source).map_err(syntax_error)?;
        if tokens.is_empty() {
            return Err(syntax_error("empty rule".to_string()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            kind,
        };
        let expr = parser.parse_or().map_err(syntax_error)?;
        if let Some(token) = parser.peek() {
            return Err(syntax_error(format!("unexpected {token} after expression")));
        }
        let specificity = expr.specificity();
        Ok(Self {
            source: source.to_string(),
            expr,
            specificity,
        })
    }

    pub fn matches<C: MatchContext + ?Sized>(&self, ctx: &C) -> bool {
        self.expr.eval(ctx)
    }

    pub fn specificity(&self) -> Specificity {
        self.specificity
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the rule can only match if the client announced a server
    /// name, i.e. it uses `HostSNI` with something other than `*`.
    pub fn requires_server_name(&self) -> bool {
        self.expr.any_predicate(&|p| {
            matches!(p, Predicate::HostSni(patterns)
                if patterns.iter().any(|pattern| *pattern != HostPattern::Any))
        })
    }
}

impl fmt::Display for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "`{name}`"),
            Token::Str(value) => write!(f, "string `{value}`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Comma => f.write_str("`,`"),
            Token::And => f.write_str("`&&`"),
            Token::Or => f.write_str("`||`"),
            Token::Not => f.write_str("`!`"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '!' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Not,
                });
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        tokens.push(if c == '&' { Token::And } else { Token::Or });
                    }
                    _ => return Err(format!("expected `{c}{c}` at offset {offset}")),
                }
            }
            '`' | '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == c => break,
                        Some((_, ch)) => value.push(ch),
                        None => {
                            return Err(format!("unterminated string starting at offset {offset}"));
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character `{other}` at offset {offset}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    kind: RuleKind,
}

impl Parser {
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

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected}, found {token}")),
            None => Err(format!("expected {expected}, found end of rule")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            terms.push(self.parse_and()?);
        }
        Ok(collapse(terms, Expr::Or))
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            terms.push(self.parse_unary()?);
        }
        Ok(collapse(terms, Expr::And))
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.parse_call(&name).map(Expr::Match),
            Some(token) => Err(format!("expected a matcher, `!` or `(`, found {token}")),
            None => Err("unexpected end of rule".to_string()),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Predicate, String> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::Str(value)) => args.push(value),
                Some(Token::RParen) if args.is_empty() => {
                    return Err(format!("`{name}` requires at least one argument"));
                }
                Some(token) => return Err(format!("expected a quoted argument, found {token}")),
                None => return Err(format!("unterminated argument list for `{name}`")),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(token) => return Err(format!("expected `,` or `)`, found {token}")),
                None => return Err(format!("unterminated argument list for `{name}`")),
            }
        }
        self.build_predicate(name, args)
    }

    fn build_predicate(&self, name: &str, args: Vec<String>) -> Result<Predicate, String> {
        let allowed = match name {
            "Host" | "Path" | "PathPrefix" | "PathRegexp" | "Header" | "Method" => {
                self.kind == RuleKind::Http
            }
            "HostSNI" => self.kind == RuleKind::Tcp,
            "ClientIP" => true,
            _ => return Err(format!("unknown matcher `{name}`")),
        };
        if !allowed {
            return Err(format!(
                "matcher `{name}` is not allowed in {} rules",
                self.kind
            ));
        }

        match name {
            "Host" => args
                .iter()
                .map(|a| HostPattern::parse(a, false))
                .collect::<Result<_, _>>()
                .map(Predicate::Host),
            "HostSNI" => args
                .iter()
                .map(|a| HostPattern::parse(a, true))
                .collect::<Result<_, _>>()
                .map(Predicate::HostSni),
            "Path" | "PathPrefix" => {
                if let Some(bad) = args.iter().find(|p| !p.starts_with('/')) {
                    return Err(format!("path `{bad}` must start with `/`"));
                }
                Ok(if name == "Path" {
                    Predicate::Path(args)
                } else {
                    Predicate::PathPrefix(args)
                })
            }
            "PathRegexp" => args
                .iter()
                .map(|a| Regex::new(a).map_err(|e| format!("invalid path regexp `{a}`: {e}")))
                .collect::<Result<_, _>>()
                .map(Predicate::PathRegexp),
            "Header" => {
                let mut args = args.into_iter();
                let (Some(header), value, None) = (args.next(), args.next(), args.next()) else {
                    return Err("`Header` takes a name and an optional value".to_string());
                };
                let name = HeaderName::from_bytes(header.as_bytes())
                    .map_err(|e| format!("invalid header name `{header}`: {e}"))?;
                Ok(Predicate::Header { name, value })
            }
            "Method" => args
                .iter()
                .map(|a| {
                    Method::from_bytes(a.to_ascii_uppercase().as_bytes())
                        .map_err(|_| format!("invalid method `{a}`"))
                })
                .collect::<Result<_, _>>()
                .map(Predicate::Method),
            _ => args
                .iter()
                .map(|a| parse_network(a))
                .collect::<Result<_, _>>()
                .map(Predicate::ClientIp),
        }
    }
}

fn collapse(mut terms: Vec<Expr>, combine: fn(Vec<Expr>) -> Expr) -> Expr {
    if terms.len() == 1 {
        terms.swap_remove(0)
    } else {
        combine(terms)
    }
}

pub(crate) fn parse_network(raw: &str) -> Result<IpNetwork, String> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(IpNetwork::from(ip));
    }
    raw.parse::<IpNetwork>()
        .map_err(|e| format!("invalid IP or CIDR `{raw}`: {e}"))
}
