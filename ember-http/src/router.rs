//! Route registration and dispatch.
//!
//! Patterns mix literal bytes with typed placeholders (`<int>`, `<uint>`,
//! `<float>`/`<double>`, `<str>`/`<string>`, `<path>`) and are stored in a
//! trie with per-byte literal edges plus one child slot per placeholder
//! type. Matching prefers literal edges, then placeholder edges in the
//! order int, uint, double, str, path; the first complete match wins.
//!
//! The trie is rebuilt and frozen by [`Router::validate`], which also
//! checks pattern well-formedness and that every bound handler's argument
//! types are compatible with the pattern's parameter tag. No rule may be
//! added once the application is running.

use std::collections::HashMap;
use std::rc::Rc;

use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::Error;
use crate::params::{
    pack_tag, tags_compatible, ParamPack, RouteHandler, RoutingParams,
};
use crate::request::Request;
use crate::response::AsyncResponse;

/// The transport-layer object representing a socket: plain TCP or a TLS
/// stream. Owned by the connection and moved to the upgrade handler on a
/// successful protocol switch.
pub trait Adaptor: AsyncRead + AsyncWrite + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + 'static> Adaptor for T {}

/// A type-erased [`Adaptor`], as handed to upgrade handlers.
pub type BoxedAdaptor = Box<dyn Adaptor>;

type Handler = Box<dyn Fn(&Request, Rc<AsyncResponse>, &RoutingParams)>;
type UpgradeHandler = Box<dyn Fn(Request, BoxedAdaptor)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ParamKind {
    Int,
    Uint,
    Double,
    Str,
    Path,
}

impl ParamKind {
    // Tie-break order between placeholder edges at the same node.
    const ALL: [Self; 5] = [Self::Int, Self::Uint, Self::Double, Self::Str, Self::Path];

    fn digit(self) -> u64 {
        match self {
            Self::Int => 1,
            Self::Uint => 2,
            Self::Double => 3,
            Self::Str => 4,
            Self::Path => 5,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Int => 0,
            Self::Uint => 1,
            Self::Double => 2,
            Self::Str => 3,
            Self::Path => 4,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Param(ParamKind),
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, Error> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = pattern;
    while let Some(open) = rest.find(['<', '>']) {
        if rest.as_bytes()[open] == b'>' {
            return Err(Error::new_route(format!(
                "unmatched '>' in route pattern {pattern:?}"
            )));
        }
        literal.push_str(&rest[..open]);
        rest = &rest[open..];
        let Some(close) = rest.find('>') else {
            return Err(Error::new_route(format!(
                "unmatched '<' in route pattern {pattern:?}"
            )));
        };
        let kind = match &rest[..=close] {
            "<int>" => ParamKind::Int,
            "<uint>" => ParamKind::Uint,
            "<float>" | "<double>" => ParamKind::Double,
            "<str>" | "<string>" => ParamKind::Str,
            "<path>" => ParamKind::Path,
            other => {
                return Err(Error::new_route(format!(
                    "invalid parameter type {other:?} in route pattern {pattern:?}"
                )));
            }
        };
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Param(kind));
        rest = &rest[close + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn tag_of_segments(segments: &[Segment]) -> u64 {
    let digits: Vec<u64> = segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Param(kind) => Some(kind.digit()),
            Segment::Literal(_) => None,
        })
        .collect();
    pack_tag(&digits)
}

/// Allowed HTTP methods of a rule, as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq)]
struct MethodMask(u16);

const METHOD_NAMES: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

impl MethodMask {
    const GET: Self = Self(1);

    fn empty() -> Self {
        Self(0)
    }

    fn bit(method: &Method) -> Option<u16> {
        METHOD_NAMES
            .iter()
            .position(|name| *name == method.as_str())
            .map(|index| 1 << index)
    }

    fn insert(&mut self, method: &Method) {
        if let Some(bit) = Self::bit(method) {
            self.0 |= bit;
        } else {
            warn!(method = %method, "ignoring unsupported method on route");
        }
    }

    fn contains(&self, method: &Method) -> bool {
        Self::bit(method).is_some_and(|bit| self.0 & bit != 0)
    }

    /// Comma-separated method list for the `Allow` header.
    fn allow_value(&self) -> String {
        let mut out = String::new();
        for (index, name) in METHOD_NAMES.iter().enumerate() {
            if self.0 & (1 << index) != 0 {
                if !out.is_empty() {
                    out.push_str(", ");
                }
                out.push_str(name);
            }
        }
        out
    }
}

/// A registered route terminal.
struct Rule {
    pattern: String,
    methods: MethodMask,
    privileges: Rc<[String]>,
    handler: Option<Handler>,
    upgrade: Option<UpgradeHandler>,
    /// Compile-time tag of a tagged registration, checked against the
    /// pattern at validation.
    expected_tag: Option<u64>,
    /// Tag of the bound handler's argument types.
    handler_tag: u64,
    /// Runtime tag of the pattern, set by `validate`.
    tag: u64,
}

impl Rule {
    fn new(pattern: String, expected_tag: Option<u64>) -> Self {
        Self {
            pattern,
            methods: MethodMask::GET,
            privileges: Rc::from(Vec::new()),
            handler: None,
            upgrade: None,
            expected_tag,
            handler_tag: 0,
            tag: 0,
        }
    }
}

/// Fluent configuration of a freshly registered rule.
pub struct RuleBuilder<'a> {
    rule: &'a mut Rule,
}

impl RuleBuilder<'_> {
    /// Replaces the allowed method set (the default is `GET` alone).
    #[must_use]
    pub fn methods(self, methods: impl IntoIterator<Item = Method>) -> Self {
        let mut mask = MethodMask::empty();
        for method in methods {
            mask.insert(&method);
        }
        self.rule.methods = mask;
        self
    }

    /// Privileges required by this route, surfaced to middleware through
    /// [`Request::required_privileges`].
    #[must_use]
    pub fn privileges<P: Into<String>>(self, privileges: impl IntoIterator<Item = P>) -> Self {
        self.rule.privileges = privileges
            .into_iter()
            .map(Into::into)
            .collect::<Vec<_>>()
            .into();
        self
    }

    /// Binds the handler. Its typed parameters (arity 0–5 of `i64`,
    /// `u64`, `f64`, `String`) must reduce to the pattern's tag, which is
    /// verified at [`Router::validate`].
    pub fn handle<Args, F>(self, handler: F)
    where
        Args: ParamPack,
        F: RouteHandler<Args>,
    {
        self.rule.handler_tag = Args::TAG;
        self.rule.handler = Some(Box::new(move |req, res, params| {
            handler.invoke(req, res, params);
        }));
    }

    /// Binds the upgrade handler that takes ownership of the socket
    /// adaptor after a successful protocol-switch request.
    pub fn upgrade<F>(self, handler: F)
    where
        F: Fn(Request, BoxedAdaptor) + 'static,
    {
        self.rule.upgrade = Some(Box::new(handler));
    }
}

#[derive(Default)]
struct Node {
    children: HashMap<u8, usize>,
    param_children: [Option<usize>; 5],
    rule_index: Option<usize>,
    /// Packed tag of the placeholders consumed up to this node.
    tag: u64,
}

struct Trie {
    nodes: Vec<Node>,
}

impl Trie {
    fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    fn add(&mut self, pattern: &str, segments: &[Segment], rule_index: usize) {
        let mut node = 0;
        let mut digits = Vec::new();
        for segment in segments {
            match segment {
                Segment::Literal(literal) => {
                    for &byte in literal.as_bytes() {
                        let existing = self.nodes[node].children.get(&byte).copied();
                        node = match existing {
                            Some(child) => child,
                            None => {
                                let child = self.push_node(&digits);
                                self.nodes[node].children.insert(byte, child);
                                child
                            }
                        };
                    }
                }
                Segment::Param(kind) => {
                    digits.push(kind.digit());
                    let existing = self.nodes[node].param_children[kind.index()];
                    node = match existing {
                        Some(child) => child,
                        None => {
                            let child = self.push_node(&digits);
                            self.nodes[node].param_children[kind.index()] = Some(child);
                            child
                        }
                    };
                }
            }
        }
        debug_assert_eq!(self.nodes[node].tag, pack_tag(&digits));
        if let Some(previous) = self.nodes[node].rule_index.replace(rule_index) {
            if previous != rule_index {
                warn!(pattern, "pattern registered twice, replacing earlier rule");
            }
        }
    }

    fn push_node(&mut self, digits: &[u64]) -> usize {
        self.nodes.push(Node {
            tag: pack_tag(digits),
            ..Node::default()
        });
        self.nodes.len() - 1
    }

    fn find(&self, path: &str) -> Option<(usize, RoutingParams)> {
        let mut params = RoutingParams::default();
        let rule = self.find_from(0, path.as_bytes(), &mut params)?;
        Some((rule, params))
    }

    fn find_from(&self, node: usize, path: &[u8], params: &mut RoutingParams) -> Option<usize> {
        if path.is_empty() {
            if let Some(rule) = self.nodes[node].rule_index {
                return Some(rule);
            }
        } else if let Some(&child) = self.nodes[node].children.get(&path[0]) {
            // Literal edges outrank placeholder edges.
            if let Some(rule) = self.find_from(child, &path[1..], params) {
                return Some(rule);
            }
        }

        for kind in ParamKind::ALL {
            let Some(child) = self.nodes[node].param_children[kind.index()] else {
                continue;
            };
            match kind {
                ParamKind::Int => {
                    let end = numeric_prefix(path, true, false);
                    if end == 0 {
                        continue;
                    }
                    let Some(value) = parse_slice::<i64>(&path[..end]) else {
                        continue;
                    };
                    params.ints.push(value);
                    if let Some(rule) = self.find_from(child, &path[end..], params) {
                        return Some(rule);
                    }
                    params.ints.pop();
                }
                ParamKind::Uint => {
                    let end = numeric_prefix(path, false, false);
                    if end == 0 {
                        continue;
                    }
                    let Some(value) = parse_slice::<u64>(&path[..end]) else {
                        continue;
                    };
                    params.uints.push(value);
                    if let Some(rule) = self.find_from(child, &path[end..], params) {
                        return Some(rule);
                    }
                    params.uints.pop();
                }
                ParamKind::Double => {
                    let end = numeric_prefix(path, true, true);
                    if end == 0 {
                        continue;
                    }
                    let Some(value) = parse_slice::<f64>(&path[..end]) else {
                        continue;
                    };
                    params.doubles.push(value);
                    if let Some(rule) = self.find_from(child, &path[end..], params) {
                        return Some(rule);
                    }
                    params.doubles.pop();
                }
                ParamKind::Str => {
                    let end = memchr::memchr(b'/', path).unwrap_or(path.len());
                    if end == 0 {
                        continue;
                    }
                    let Ok(value) = std::str::from_utf8(&path[..end]) else {
                        continue;
                    };
                    params.strings.push(value.to_owned());
                    if let Some(rule) = self.find_from(child, &path[end..], params) {
                        return Some(rule);
                    }
                    params.strings.pop();
                }
                ParamKind::Path => {
                    let Ok(value) = std::str::from_utf8(path) else {
                        continue;
                    };
                    params.strings.push(value.to_owned());
                    if let Some(rule) = self.find_from(child, &[], params) {
                        return Some(rule);
                    }
                    params.strings.pop();
                }
            }
        }
        None
    }
}

/// Longest syntactic numeric prefix: optional sign, digits, and (for
/// floating point) a single decimal point.
fn numeric_prefix(path: &[u8], signed: bool, decimal: bool) -> usize {
    let mut end = 0;
    if signed && !path.is_empty() && (path[0] == b'-' || path[0] == b'+') {
        end = 1;
    }
    let mut seen_digit = false;
    let mut seen_dot = false;
    while end < path.len() {
        match path[end] {
            b'0'..=b'9' => seen_digit = true,
            b'.' if decimal && !seen_dot && seen_digit => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return 0;
    }
    // A trailing dot belongs to the literal remainder, not to the number.
    if seen_dot && path[end - 1] == b'.' {
        end -= 1;
    }
    end
}

fn parse_slice<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Maps `(method, path)` pairs to registered rules.
pub struct Router {
    rules: Vec<Rule>,
    trie: Trie,
    validated: bool,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            trie: Trie::new(),
            validated: false,
        }
    }

    /// Registers a rule whose pattern tag was computed at compile time
    /// (see the [`route!`](crate::route) macro).
    pub fn new_rule_tagged<const TAG: u64>(&mut self, pattern: &str) -> RuleBuilder<'_> {
        self.new_rule(pattern, Some(TAG))
    }

    /// Registers a rule whose tag is computed from the pattern at
    /// [`validate`](Self::validate) time.
    pub fn new_rule_dynamic(&mut self, pattern: &str) -> RuleBuilder<'_> {
        self.new_rule(pattern, None)
    }

    fn new_rule(&mut self, pattern: &str, expected_tag: Option<u64>) -> RuleBuilder<'_> {
        self.validated = false;
        self.rules.push(Rule::new(pattern.to_owned(), expected_tag));
        let index = self.rules.len() - 1;
        RuleBuilder {
            rule: &mut self.rules[index],
        }
    }

    /// Checks every registered rule and freezes the trie. Idempotent;
    /// called again only after new registrations.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.validated {
            return Ok(());
        }
        let mut trie = Trie::new();
        for (index, rule) in self.rules.iter_mut().enumerate() {
            let segments = parse_pattern(&rule.pattern)?;
            let tag = tag_of_segments(&segments);
            if let Some(expected) = rule.expected_tag {
                if expected != tag {
                    return Err(Error::new_route(format!(
                        "tag of route pattern {:?} does not match its registration tag",
                        rule.pattern
                    )));
                }
            }
            if rule.handler.is_none() && rule.upgrade.is_none() {
                return Err(Error::new_route(format!(
                    "route {:?} has no handler bound",
                    rule.pattern
                )));
            }
            if rule.handler.is_some() && !tags_compatible(tag, rule.handler_tag) {
                return Err(Error::new_route(format!(
                    "handler arguments do not match the parameters of route {:?}",
                    rule.pattern
                )));
            }
            rule.tag = tag;
            trie.add(&rule.pattern, &segments, index);
            debug!(pattern = %rule.pattern, tag = rule.tag, "route registered");
        }
        self.trie = trie;
        self.validated = true;
        Ok(())
    }

    /// Registered patterns, for startup diagnostics.
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.pattern.as_str())
    }

    fn resolve(&self, path: &str) -> Option<(usize, RoutingParams)> {
        self.trie.find(path)
    }

    /// Privileges of the rule matching `path`, resolved before the
    /// middleware chain runs.
    #[must_use]
    pub fn required_privileges(&self, path: &str) -> Option<Rc<[String]>> {
        let (index, _) = self.resolve(path)?;
        Some(self.rules[index].privileges.clone())
    }

    /// True when `path` resolves to a rule carrying an upgrade handler.
    #[must_use]
    pub fn can_upgrade(&self, path: &str) -> bool {
        self.resolve(path)
            .is_some_and(|(index, _)| self.rules[index].upgrade.is_some())
    }

    /// Dispatches a request: 404 on a miss, 405 with `Allow` on a method
    /// mismatch, otherwise the bound handler with its decoded parameters.
    pub fn handle(&self, req: &Request, res: Rc<AsyncResponse>) {
        let Some((index, params)) = self.resolve(&req.path) else {
            debug!(path = %req.path, "no route matched");
            res.response().set_status(StatusCode::NOT_FOUND);
            res.end();
            return;
        };
        let rule = &self.rules[index];
        if !rule.methods.contains(&req.method) {
            let mut response = res.response();
            response.set_status(StatusCode::METHOD_NOT_ALLOWED);
            if let Ok(allow) = HeaderValue::from_str(&rule.methods.allow_value()) {
                response.add_header(header::ALLOW, allow);
            }
            drop(response);
            res.end();
            return;
        }
        let Some(handler) = &rule.handler else {
            // Upgrade-only rule reached without a protocol switch.
            res.response().set_status(StatusCode::NOT_FOUND);
            res.end();
            return;
        };
        handler(req, res, &params);
    }

    /// Transfers the socket adaptor to the matched rule's upgrade
    /// handler. The caller checks [`can_upgrade`](Self::can_upgrade)
    /// first; a miss here returns the pieces back.
    pub fn handle_upgrade(
        &self,
        req: Request,
        adaptor: BoxedAdaptor,
    ) -> Result<(), (Request, BoxedAdaptor)> {
        let Some((index, _)) = self.resolve(&req.path) else {
            return Err((req, adaptor));
        };
        let Some(upgrade) = &self.rules[index].upgrade else {
            return Err((req, adaptor));
        };
        upgrade(req, adaptor);
        Ok(())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
