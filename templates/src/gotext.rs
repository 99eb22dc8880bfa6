//! Translation of Go `text/template` sources into the Jinja dialect.
//!
//! Prompt templates written for the Go flavor use `{{ .Field }}` actions,
//! prefix function calls and `{{ end }}`-terminated blocks. They are
//! rewritten once, at compile time, into an equivalent Jinja source so both
//! flavors share a single rendering engine. Field names are mapped from
//! `CamelCase` to the `snake_case` keys the render context carries.

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Str(String),
    Num(String),
    /// `.A.B`; empty for a bare `.`. `chained` marks a field directly
    /// following a closing parenthesis.
    Field { path: Vec<String>, chained: bool },
    /// `$x.A`; the name is empty for `$`
    Var(String, Vec<String>),
    Ident(String),
    LParen,
    RParen,
    Pipe,
    Declare,
    Assign,
    Comma,
}

/// Go field name to context key: `RoleName` becomes `role_name`, `ID`
/// becomes `id`.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower)
            {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

fn lex(action: &str) -> Result<Vec<Tok>, String> {
    let bytes = action.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let ident_char = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let read_path = |mut i: usize| {
        let mut path = Vec::new();
        while i < bytes.len() && bytes[i] == b'.' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && ident_char(bytes[end]) {
                end += 1;
            }
            if end == start {
                i = start;
                break;
            }
            path.push(action[start..end].to_string());
            i = end;
        }
        (path, i)
    };

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Tok::RParen);
                i += 1;
                if bytes.get(i) == Some(&b'.') {
                    let (path, next) = read_path(i);
                    tokens.push(Tok::Field {
                        path,
                        chained: true,
                    });
                    i = next;
                }
            }
            b'|' => {
                tokens.push(Tok::Pipe);
                i += 1;
            }
            b',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            b':' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Tok::Declare);
                i += 2;
            }
            b'=' => {
                tokens.push(Tok::Assign);
                i += 1;
            }
            b'"' => {
                let mut stream =
                    serde_json::Deserializer::from_str(&action[i..]).into_iter::<String>();
                match stream.next() {
                    Some(Ok(s)) => {
                        tokens.push(Tok::Str(s));
                        i += stream.byte_offset();
                    }
                    _ => return Err("unterminated string".to_string()),
                }
            }
            b'`' => {
                let end = action[i + 1..]
                    .find('`')
                    .ok_or_else(|| "unterminated raw string".to_string())?;
                tokens.push(Tok::Str(action[i + 1..i + 1 + end].to_string()));
                i += end + 2;
            }
            b'\'' => {
                let rest = &action[i + 1..];
                let c = rest.chars().next().ok_or("unterminated char")?;
                if !rest[c.len_utf8()..].starts_with('\'') {
                    return Err("unterminated char constant".to_string());
                }
                tokens.push(Tok::Num((c as u32).to_string()));
                i += c.len_utf8() + 2;
            }
            b'.' => {
                let (path, next) = read_path(i);
                tokens.push(Tok::Field {
                    path,
                    chained: false,
                });
                i = next.max(i + 1);
            }
            b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && ident_char(bytes[end]) {
                    end += 1;
                }
                let (path, next) = read_path(end);
                tokens.push(Tok::Var(action[start..end].to_string(), path));
                i = next;
            }
            b'-' | b'+' | b'0'..=b'9' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.' || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Tok::Num(action[start..i].replace('_', "")));
            }
            b if ident_char(b) => {
                let start = i;
                while i < bytes.len() && ident_char(bytes[i]) {
                    i += 1;
                }
                tokens.push(Tok::Ident(action[start..i].to_string()));
            }
            _ => return Err(format!("unexpected character {:?}", b as char)),
        }
    }
    Ok(tokens)
}

/// A block opened by an action and closed by `{{ end }}`.
enum Frame {
    If,
    Range { dot: String },
    With { dot: String },
}

struct Translator {
    frames: Vec<Frame>,
    counter: usize,
}

struct Expr<'t> {
    tokens: &'t [Tok],
    pos: usize,
    dot: Option<&'t str>,
}

impl<'t> Expr<'t> {
    fn peek(&self) -> Option<&'t Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'t Tok> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn field(&self, path: &[String]) -> String {
        let mapped: Vec<String> = path.iter().map(|p| snake_case(p)).collect();
        match (self.dot, mapped.is_empty()) {
            (None, true) => "__root".to_string(),
            (None, false) => mapped.join("."),
            (Some(dot), true) => dot.to_string(),
            (Some(dot), false) => format!("{dot}.{}", mapped.join(".")),
        }
    }

    fn var(name: &str, path: &[String]) -> String {
        let mapped: Vec<String> = path.iter().map(|p| snake_case(p)).collect();
        if name.is_empty() {
            // `$` is the root context
            return if mapped.is_empty() {
                "__root".to_string()
            } else {
                mapped.join(".")
            };
        }
        let mut out = format!("v_{name}");
        for p in mapped {
            out.push('.');
            out.push_str(&p);
        }
        out
    }

    fn pipeline(&mut self) -> Result<String, String> {
        let mut expr = self.command(None)?;
        while self.peek() == Some(&Tok::Pipe) {
            self.next();
            expr = self.command(Some(expr))?;
        }
        Ok(expr)
    }

    fn command(&mut self, piped: Option<String>) -> Result<String, String> {
        if let Some(Tok::Ident(name)) = self.peek() {
            if !matches!(name.as_str(), "true" | "false" | "nil") {
                self.next();
                let mut args = Vec::new();
                while let Some(arg) = self.operand()? {
                    args.push(arg);
                }
                args.extend(piped);
                return Ok(call(name, args));
            }
        }
        let operand = self.operand()?.ok_or("missing operand")?;
        if piped.is_some() {
            return Err("non-function command in pipeline".to_string());
        }
        if let Some(tok) = self.peek() {
            if !matches!(tok, Tok::Pipe | Tok::RParen) {
                return Err("unexpected argument after operand".to_string());
            }
        }
        Ok(operand)
    }

    fn operand(&mut self) -> Result<Option<String>, String> {
        let Some(tok) = self.peek() else {
            return Ok(None);
        };
        let out = match tok {
            Tok::Str(s) => serde_json::to_string(s).map_err(|e| e.to_string())?,
            Tok::Num(n) => n.clone(),
            Tok::Field { path, .. } => self.field(path),
            Tok::Var(name, path) => Self::var(name, path),
            Tok::Ident(word) => match word.as_str() {
                "true" | "false" => word.clone(),
                "nil" => "none".to_string(),
                other => format!("{other}()"),
            },
            Tok::LParen => {
                self.next();
                let inner = self.pipeline()?;
                if self.next() != Some(&Tok::RParen) {
                    return Err("unclosed parenthesis".to_string());
                }
                let mut out = format!("({inner})");
                if let Some(Tok::Field {
                    path,
                    chained: true,
                }) = self.peek()
                {
                    for p in path {
                        out.push('.');
                        out.push_str(&snake_case(p));
                    }
                    self.next();
                }
                return Ok(Some(out));
            }
            _ => return Ok(None),
        };
        self.next();
        Ok(Some(out))
    }
}

/// Go builtin or helper call rendered as a Jinja expression.
fn call(name: &str, args: Vec<String>) -> String {
    let binary = |op: &str| -> Option<String> {
        (args.len() == 2).then(|| format!("({} {op} {})", args[0], args[1]))
    };
    let rendered = match name {
        "and" => Some(format!("({})", args.join(" and "))),
        "or" => Some(format!("({})", args.join(" or "))),
        "not" => args.first().map(|a| format!("(not {a})")),
        "eq" => binary("=="),
        "ne" => binary("!="),
        "lt" => binary("<"),
        "le" => binary("<="),
        "gt" => binary(">"),
        "ge" => binary(">="),
        "len" => args.first().map(|a| format!("({a}|length)")),
        _ => None,
    };
    rendered.unwrap_or_else(|| format!("{name}({})", args.join(", ")))
}

impl Translator {
    fn dot(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Range { dot } | Frame::With { dot } => Some(dot.as_str()),
            Frame::If => None,
        })
    }

    fn expr(&self, tokens: &[Tok]) -> Result<String, String> {
        let mut expr = Expr {
            tokens,
            pos: 0,
            dot: self.dot(),
        };
        let out = expr.pipeline()?;
        if expr.pos < tokens.len() {
            return Err("trailing tokens in action".to_string());
        }
        Ok(out)
    }

    fn action(&mut self, body: &str) -> Result<String, String> {
        let body = body.trim();
        if body.starts_with("/*") {
            return Ok(String::new());
        }
        let (keyword, rest) = match body.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (body, ""),
        };
        match keyword {
            "if" => {
                let cond = self.expr(&lex(rest)?)?;
                self.frames.push(Frame::If);
                Ok(format!("{{% if {cond} %}}"))
            }
            "else" if rest.is_empty() => Ok("{% else %}".to_string()),
            "else" => {
                let Some(cond) = rest.strip_prefix("if") else {
                    return Err(format!("unsupported else form: {rest}"));
                };
                if !matches!(self.frames.last(), Some(Frame::If)) {
                    return Err("else if outside if".to_string());
                }
                let cond = self.expr(&lex(cond)?)?;
                Ok(format!("{{% elif {cond} %}}"))
            }
            "end" => match self.frames.pop() {
                Some(Frame::If) => Ok("{% endif %}".to_string()),
                Some(Frame::Range { .. }) => Ok("{% endfor %}".to_string()),
                Some(Frame::With { .. }) => Ok("{% endif %}{% endwith %}".to_string()),
                None => Err("unexpected end".to_string()),
            },
            "range" => self.range(rest),
            "with" => {
                let value = self.expr(&lex(rest)?)?;
                self.counter += 1;
                let dot = format!("__w{}", self.counter);
                let out = format!("{{% with {dot} = {value} %}}{{% if {dot} %}}");
                self.frames.push(Frame::With { dot });
                Ok(out)
            }
            "break" | "continue" => Ok(format!("{{% {keyword} %}}")),
            "define" | "template" | "block" => Err(format!("`{keyword}` is not supported")),
            _ => {
                let tokens = lex(body)?;
                if let [Tok::Var(name, path), Tok::Declare | Tok::Assign, value @ ..] =
                    tokens.as_slice()
                {
                    if path.is_empty() && !name.is_empty() {
                        let value = self.expr(value)?;
                        return Ok(format!("{{% set v_{name} = {value} %}}"));
                    }
                }
                Ok(format!("{{{{ {} }}}}", self.expr(&tokens)?))
            }
        }
    }

    fn range(&mut self, rest: &str) -> Result<String, String> {
        let tokens = lex(rest)?;
        let (vars, value): (Vec<&str>, &[Tok]) = match tokens.as_slice() {
            [Tok::Var(i, _), Tok::Comma, Tok::Var(e, _), Tok::Declare, value @ ..] => {
                (vec![i.as_str(), e.as_str()], value)
            }
            [Tok::Var(e, _), Tok::Declare, value @ ..] => (vec![e.as_str()], value),
            value => (Vec::new(), value),
        };
        let value = self.expr(value)?;
        self.counter += 1;
        let dot = format!("__it{}", self.counter);
        let mut out = format!("{{% for {dot} in {value} %}}");
        match vars.as_slice() {
            [index, elem] => {
                out.push_str(&format!("{{% set v_{index} = loop.index0 %}}"));
                out.push_str(&format!("{{% set v_{elem} = {dot} %}}"));
            }
            [elem] => out.push_str(&format!("{{% set v_{elem} = {dot} %}}")),
            _ => {}
        }
        self.frames.push(Frame::Range { dot });
        Ok(out)
    }
}

fn push_text(out: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if text.contains("{%") || text.contains("{#") || text.contains("{{") {
        out.push_str("{% raw %}");
        out.push_str(text);
        out.push_str("{% endraw %}");
    } else {
        out.push_str(text);
    }
}

/// Rewrite a Go template into Jinja. The error describes the first
/// construct that could not be translated.
pub fn translate(source: &str) -> Result<String, String> {
    let mut translator = Translator {
        frames: Vec::new(),
        counter: 0,
    };
    let mut out = String::with_capacity(source.len() + 32);
    let mut pending_text = String::new();
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        pending_text.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = find_action_end(after).ok_or("unclosed action")?;
        let mut body = &after[..close];
        rest = &after[close + 2..];

        if let Some(trimmed) = body.strip_prefix('-').filter(|b| b.starts_with(char::is_whitespace)) {
            body = trimmed;
            pending_text.truncate(pending_text.trim_end().len());
        }
        if let Some(trimmed) = body.strip_suffix('-').filter(|b| b.ends_with(char::is_whitespace)) {
            body = trimmed;
            rest = rest.trim_start();
        }

        push_text(&mut out, &pending_text);
        pending_text.clear();
        let rendered = translator.action(body)?;
        out.push_str(&rendered);
    }
    pending_text.push_str(rest);
    push_text(&mut out, &pending_text);

    if !translator.frames.is_empty() {
        return Err("unexpected EOF: missing {{ end }}".to_string());
    }
    Ok(out)
}

/// Offset of the `}}` closing an action, skipping quoted strings.
fn find_action_end(after: &str) -> Option<usize> {
    let bytes = after.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q == b'"' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_become_snake_case() {
        assert_eq!(snake_case("RoleName"), "role_name");
        assert_eq!(snake_case("ID"), "id");
        assert_eq!(snake_case("HTMLText"), "html_text");
        assert_eq!(snake_case("content"), "content");
    }

    #[test]
    fn translates_fields_and_conditions() {
        let out = translate(r#"{{if eq .RoleName "user"}}U: {{.Content}}{{else}}A{{end}}"#).unwrap();
        assert_eq!(
            out,
            r#"{% if (role_name == "user") %}U: {{ content }}{% else %}A{% endif %}"#
        );
    }

    #[test]
    fn trim_markers_are_applied_to_text() {
        let out = translate("a  \n{{- .X -}}\n  b").unwrap();
        assert_eq!(out, "a{{ x }}b");
    }

    #[test]
    fn ranges_rebind_dot() {
        let out = translate("{{ range .Images }}[img-{{ add1 .ID }}]{{end}}{{.Text}}").unwrap();
        assert_eq!(
            out,
            "{% for __it1 in images %}[img-{{ add1(__it1.id) }}]{% endfor %}{{ text }}"
        );
    }

    #[test]
    fn pipelines_pass_the_previous_value_last() {
        let out = translate(r#"{{ .Input | trimSuffix "\n" | upper }}"#).unwrap();
        assert_eq!(out, r#"{{ upper(trimSuffix("\n", input)) }}"#);
    }

    #[test]
    fn variables_and_comments() {
        let out = translate("{{/* note */}}{{ $x := .A }}{{ range $i, $m := .Messages }}{{$i}}{{ $m.Role }}{{ end }}").unwrap();
        assert_eq!(
            out,
            "{% set v_x = a %}{% for __it1 in messages %}{% set v_i = loop.index0 %}{% set v_m = __it1 %}{{ v_i }}{{ v_m.role }}{% endfor %}"
        );
    }

    #[test]
    fn jinja_syntax_in_text_is_escaped() {
        let out = translate("{% not a tag %} {{.A}}").unwrap();
        assert_eq!(out, "{% raw %}{% not a tag %} {% endraw %}{{ a }}");
    }

    #[test]
    fn rejects_broken_templates() {
        assert!(translate("{{ if .A }}open").is_err());
        assert!(translate("{{ .A ").is_err());
        assert!(translate("{{ end }}").is_err());
        assert!(translate(r#"{{ template "x" }}"#).is_err());
    }
}
