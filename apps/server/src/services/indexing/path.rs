//! Evaluator for the FHIRPath subset used by search parameter expressions.
//!
//! Supported: dotted paths rooted at the resource type (or `Resource` /
//! `DomainResource`), `|` unions, `X as T` and `(X as T)`, `.as(T)`,
//! `.ofType(T)`, `.where(resolve() is T)`, `.where(path = 'literal')`,
//! `.extension('url')`, `.first()` and choice element expansion
//! (`value` matches `valueQuantity` with type `Quantity`).

use serde_json::Value as JsonValue;

/// An evaluation result: a JSON node plus the type implied by a choice
/// element name, when there was one.
#[derive(Debug, Clone)]
pub struct Node<'a> {
    pub value: &'a JsonValue,
    pub type_hint: Option<String>,
}

impl<'a> Node<'a> {
    fn plain(value: &'a JsonValue) -> Self {
        Self {
            value,
            type_hint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpression {
    branches: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq)]
struct Branch {
    term: Term,
    steps: Vec<Step>,
    cast: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    /// Steps starting at the evaluation root.
    Root,
    Group(Box<PathExpression>),
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    As(String),
    Where(Predicate),
    Extension(String),
    First,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    ResolveIs(String),
    Equals { path: Vec<Step>, literal: String },
}

impl PathExpression {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts = split_top_level(expression, '|')?;
        let branches = parts
            .into_iter()
            .map(parse_branch)
            .collect::<Result<Vec<_>, _>>()?;
        if branches.is_empty() {
            return Err("empty expression".to_string());
        }
        Ok(Self { branches })
    }

    /// Evaluate against a whole resource. Branches rooted at another
    /// resource type yield nothing.
    pub fn evaluate<'a>(&self, resource_type: &str, resource: &'a JsonValue) -> Vec<Node<'a>> {
        self.evaluate_from(Some(resource_type), vec![Node::plain(resource)])
    }

    /// Evaluate relative to `context` (composite components).
    pub fn evaluate_relative<'a>(&self, context: &Node<'a>) -> Vec<Node<'a>> {
        self.evaluate_from(None, vec![context.clone()])
    }

    fn evaluate_from<'a>(&self, resource_type: Option<&str>, input: Vec<Node<'a>>) -> Vec<Node<'a>> {
        let mut out = Vec::new();
        for branch in &self.branches {
            let start = match &branch.term {
                Term::Root => input.clone(),
                Term::Group(inner) => inner.evaluate_from(resource_type, input.clone()),
            };
            let mut steps = branch.steps.as_slice();
            if let (Term::Root, Some(Step::Field(first))) = (&branch.term, steps.first()) {
                if is_type_name(first) {
                    match resource_type {
                        Some(rt) if first == rt || first == "Resource" || first == "DomainResource" => {
                            steps = &steps[1..];
                        }
                        _ => continue,
                    }
                }
            }
            let mut nodes = apply_steps(steps, start);
            if let Some(cast) = &branch.cast {
                nodes.retain(|n| node_is_type(n, cast));
            }
            out.extend(nodes);
        }
        out
    }
}

fn is_type_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn apply_steps<'a>(steps: &[Step], mut nodes: Vec<Node<'a>>) -> Vec<Node<'a>> {
    for step in steps {
        nodes = match step {
            Step::Field(name) => nodes.iter().flat_map(|n| field(n, name)).collect(),
            Step::As(type_name) => nodes.into_iter().filter(|n| node_is_type(n, type_name)).collect(),
            Step::Where(predicate) => nodes.into_iter().filter(|n| predicate.matches(n)).collect(),
            Step::Extension(url) => nodes
                .iter()
                .flat_map(|n| field(n, "extension"))
                .filter(|n| n.value.get("url").and_then(|u| u.as_str()) == Some(url.as_str()))
                .collect(),
            Step::First => nodes.into_iter().take(1).collect(),
        };
        if nodes.is_empty() {
            break;
        }
    }
    nodes
}

fn push_flattened<'a>(value: &'a JsonValue, type_hint: Option<String>, out: &mut Vec<Node<'a>>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                out.push(Node {
                    value: item,
                    type_hint: type_hint.clone(),
                });
            }
        }
        JsonValue::Null => {}
        other => out.push(Node {
            value: other,
            type_hint,
        }),
    }
}

/// Child `name` of `node`, expanding choice elements.
fn field<'a>(node: &Node<'a>, name: &str) -> Vec<Node<'a>> {
    let mut out = Vec::new();
    let Some(obj) = node.value.as_object() else {
        return out;
    };
    if let Some(value) = obj.get(name) {
        push_flattened(value, None, &mut out);
        return out;
    }
    for (key, value) in obj {
        if let Some(suffix) = key.strip_prefix(name) {
            if is_type_name(suffix) {
                push_flattened(value, Some(choice_type_name(suffix)), &mut out);
            }
        }
    }
    out
}

const PRIMITIVE_TYPES: &[&str] = &[
    "Base64Binary",
    "Boolean",
    "Canonical",
    "Code",
    "Date",
    "DateTime",
    "Decimal",
    "Id",
    "Instant",
    "Integer",
    "Integer64",
    "Markdown",
    "Oid",
    "PositiveInt",
    "String",
    "Time",
    "UnsignedInt",
    "Uri",
    "Url",
    "Uuid",
];

/// `DateTime` → `dateTime`, `Quantity` → `Quantity`.
fn choice_type_name(suffix: &str) -> String {
    if PRIMITIVE_TYPES.contains(&suffix) {
        let mut chars = suffix.chars();
        match chars.next() {
            Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
            None => String::new(),
        }
    } else {
        suffix.to_string()
    }
}

fn node_is_type(node: &Node<'_>, type_name: &str) -> bool {
    match &node.type_hint {
        Some(hint) => hint.eq_ignore_ascii_case(type_name),
        // Not a choice element: accept when the JSON shape fits.
        None => {
            let primitive = type_name.chars().next().is_some_and(|c| c.is_ascii_lowercase());
            if primitive {
                !node.value.is_object()
            } else {
                node.value.is_object()
            }
        }
    }
}

impl Predicate {
    fn matches(&self, node: &Node<'_>) -> bool {
        match self {
            Predicate::ResolveIs(type_name) => reference_type(node.value).as_deref() == Some(type_name.as_str()),
            Predicate::Equals { path, literal } => apply_steps(path, vec![node.clone()])
                .iter()
                .any(|n| scalar_text(n.value).as_deref() == Some(literal.as_str())),
        }
    }
}

/// Resource type a Reference points at, from its `reference` or `type`.
fn reference_type(value: &JsonValue) -> Option<String> {
    if let Some(reference) = value.get("reference").and_then(|r| r.as_str()) {
        match meridian_search::parse_reference(reference) {
            meridian_search::ParsedReference::Local { resource_type, .. } => return Some(resource_type),
            meridian_search::ParsedReference::Absolute {
                resource_type: Some(t), ..
            } => return Some(t),
            _ => {}
        }
    }
    value.get("type").and_then(|t| t.as_str()).map(str::to_string)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Split on `sep` outside parentheses and quotes.
fn split_top_level(input: &str, sep: char) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unbalanced ')' in '{input}'"));
                }
            }
            c if c == sep && !quoted && depth == 0 => {
                parts.push(input[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 || quoted {
        return Err(format!("unbalanced expression '{input}'"));
    }
    parts.push(input[start..].trim());
    Ok(parts)
}

/// Byte offset of `keyword` outside parentheses and quotes.
fn find_top_level(input: &str, keyword: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quoted = false;
    for (i, c) in input.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            _ if depth == 0 && !quoted && input[i..].starts_with(keyword) => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_branch(input: &str) -> Result<Branch, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty union branch".to_string());
    }
    if let Some(pos) = find_top_level(input, " as ") {
        let type_name = input[pos + 4..].trim();
        if !is_identifier(type_name) {
            return Err(format!("invalid type '{type_name}'"));
        }
        let mut branch = parse_branch(&input[..pos])?;
        if branch.cast.is_some() {
            return Err(format!("nested 'as' in '{input}'"));
        }
        branch.cast = Some(type_name.to_string());
        return Ok(branch);
    }

    if let Some(rest) = input.strip_prefix('(') {
        let close = matching_paren(rest).ok_or_else(|| format!("unbalanced '(' in '{input}'"))?;
        let inner = PathExpression::parse(&rest[..close])?;
        let after = rest[close + 1..].trim();
        let steps = match after.strip_prefix('.') {
            Some(tail) => parse_steps(tail)?,
            None if after.is_empty() => Vec::new(),
            None => return Err(format!("unexpected '{after}' after group")),
        };
        return Ok(Branch {
            term: Term::Group(Box::new(inner)),
            steps,
            cast: None,
        });
    }

    Ok(Branch {
        term: Term::Root,
        steps: parse_steps(input)?,
        cast: None,
    })
}

/// Index of the `)` closing an already opened parenthesis in `input`.
fn matching_paren(input: &str) -> Option<usize> {
    let mut depth = 1i32;
    let mut quoted = false;
    for (i, c) in input.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_steps(input: &str) -> Result<Vec<Step>, String> {
    split_top_level(input, '.')?.into_iter().map(parse_step).collect()
}

fn parse_step(segment: &str) -> Result<Step, String> {
    let segment = segment.trim().trim_matches('`');
    let Some(open) = segment.find('(') else {
        if is_identifier(segment) {
            return Ok(Step::Field(segment.to_string()));
        }
        return Err(format!("invalid path segment '{segment}'"));
    };
    let name = &segment[..open];
    let args = segment[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| format!("invalid call '{segment}'"))?
        .trim();
    match name {
        "as" | "ofType" if is_identifier(args) => Ok(Step::As(args.to_string())),
        "where" => parse_predicate(args).map(Step::Where),
        "extension" => Ok(Step::Extension(parse_literal(args)?)),
        "first" if args.is_empty() => Ok(Step::First),
        _ => Err(format!("unsupported function '{segment}'")),
    }
}

fn parse_predicate(input: &str) -> Result<Predicate, String> {
    if let Some(type_name) = input.strip_prefix("resolve() is ") {
        let type_name = type_name.trim();
        if is_identifier(type_name) {
            return Ok(Predicate::ResolveIs(type_name.to_string()));
        }
    }
    if let Some(pos) = find_top_level(input, "=") {
        let path = parse_steps(input[..pos].trim())?;
        if path.iter().any(|s| !matches!(s, Step::Field(_))) {
            return Err(format!("unsupported where() path in '{input}'"));
        }
        return Ok(Predicate::Equals {
            path,
            literal: parse_literal(input[pos + 1..].trim())?,
        });
    }
    Err(format!("unsupported where() criteria '{input}'"))
}

fn parse_literal(input: &str) -> Result<String, String> {
    input
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("\\'", "'"))
        .ok_or_else(|| format!("expected a quoted literal, found '{input}'"))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
