//! Helper functions available to templates.
//!
//! The Go flavor gets the text/template builtins plus the string and
//! arithmetic helpers of the sprig library under their usual names. The
//! Jinja flavor gets the HuggingFace chat-template extras.

use minijinja::{
    value::{Rest, Value},
    Environment, Error, ErrorKind,
};

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, msg.into())
}

fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("toJson: {e}")))
}

fn index(value: Value, keys: Rest<Value>) -> Result<Value, Error> {
    keys.iter().try_fold(value, |v, key| v.get_item(key))
}

fn printf(format: String, args: Rest<Value>) -> Result<String, Error> {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut precision = None;
        while let Some(&d) = chars.peek() {
            if d == '.' {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(d);
                    chars.next();
                }
                precision = digits.parse::<usize>().ok();
            } else if d.is_ascii_digit() || matches!(d, '-' | '+' | ' ' | '#') {
                chars.next();
            } else {
                break;
            }
        }
        let Some(verb) = chars.next() else {
            out.push('%');
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args
            .next()
            .ok_or_else(|| invalid(format!("printf: missing argument for %{verb}")))?;
        match verb {
            'd' => out.push_str(&i64::try_from(arg.clone())?.to_string()),
            'f' => {
                let f = f64::try_from(arg.clone())?;
                out.push_str(&format!("{f:.*}", precision.unwrap_or(6)));
            }
            'q' => out.push_str(&serde_json::to_string(&arg.to_string()).unwrap_or_default()),
            _ => out.push_str(&arg.to_string()),
        }
    }
    Ok(out)
}

fn is_empty(value: &Value) -> bool {
    value.is_undefined() || value.is_none() || !value.is_true()
}

fn title(s: String) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if at_word_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = c.is_whitespace();
    }
    out
}

fn indent(width: usize, s: String) -> String {
    let pad = " ".repeat(width);
    s.lines()
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn register_go_helpers(env: &mut Environment<'_>) {
    env.add_function("toJson", to_json);
    env.add_function("toString", |v: Value| v.to_string());
    env.add_function("print", |args: Rest<Value>| {
        args.iter().map(ToString::to_string).collect::<String>()
    });
    env.add_function("println", |args: Rest<Value>| {
        let parts: Vec<String> = args.iter().map(ToString::to_string).collect();
        format!("{}\n", parts.join(" "))
    });
    env.add_function("printf", printf);
    env.add_function("index", index);
    env.add_function("html", |s: String| s);
    env.add_function("js", |s: String| s);
    env.add_function("urlquery", |s: String| s);

    env.add_function("add", |args: Rest<i64>| args.iter().sum::<i64>());
    env.add_function("add1", |a: i64| a + 1);
    env.add_function("sub", |a: i64, b: i64| a - b);
    env.add_function("mul", |args: Rest<i64>| args.iter().product::<i64>());
    env.add_function("div", |a: i64, b: i64| {
        a.checked_div(b).ok_or_else(|| invalid("div: division by zero"))
    });
    env.add_function("mod", |a: i64, b: i64| {
        a.checked_rem(b).ok_or_else(|| invalid("mod: division by zero"))
    });
    env.add_function("max", |args: Rest<i64>| args.iter().copied().max().unwrap_or(0));
    env.add_function("min", |args: Rest<i64>| args.iter().copied().min().unwrap_or(0));

    env.add_function("upper", |s: String| s.to_uppercase());
    env.add_function("lower", |s: String| s.to_lowercase());
    env.add_function("title", title);
    env.add_function("trim", |s: String| s.trim().to_string());
    env.add_function("trimAll", |cut: String, s: String| {
        s.trim_matches(|c| cut.contains(c)).to_string()
    });
    env.add_function("trimPrefix", |prefix: String, s: String| {
        s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string()
    });
    env.add_function("trimSuffix", |suffix: String, s: String| {
        s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string()
    });
    env.add_function("hasPrefix", |prefix: String, s: String| s.starts_with(&prefix));
    env.add_function("hasSuffix", |suffix: String, s: String| s.ends_with(&suffix));
    env.add_function("contains", |needle: String, s: String| s.contains(&needle));
    env.add_function("replace", |old: String, new: String, s: String| {
        s.replace(&old, &new)
    });
    env.add_function("repeat", |count: usize, s: String| s.repeat(count));
    env.add_function("join", |sep: String, list: Value| -> Result<String, Error> {
        let parts: Vec<String> = list.try_iter()?.map(|v| v.to_string()).collect();
        Ok(parts.join(&sep))
    });
    env.add_function("splitList", |sep: String, s: String| {
        Value::from(s.split(&sep).map(str::to_string).collect::<Vec<_>>())
    });
    env.add_function("quote", |args: Rest<Value>| {
        let parts: Vec<String> = args
            .iter()
            .map(|v| serde_json::to_string(&v.to_string()).unwrap_or_default())
            .collect();
        parts.join(" ")
    });
    env.add_function("squote", |args: Rest<Value>| {
        let parts: Vec<String> = args.iter().map(|v| format!("'{v}'")).collect();
        parts.join(" ")
    });
    env.add_function("indent", indent);
    env.add_function("nindent", |width: usize, s: String| format!("\n{}", indent(width, s)));

    env.add_function("default", |fallback: Value, value: Option<Value>| {
        match value {
            Some(v) if !is_empty(&v) => v,
            _ => fallback,
        }
    });
    env.add_function("empty", |value: Option<Value>| value.is_none_or(|v| is_empty(&v)));
    env.add_function("coalesce", |args: Rest<Value>| {
        args.iter().find(|v| !is_empty(v)).cloned().unwrap_or_default()
    });
    env.add_function("list", |args: Rest<Value>| Value::from(args.0));
}

pub(crate) fn register_jinja_helpers(env: &mut Environment<'_>) {
    minijinja_contrib::add_to_environment(env);
    env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
    env.add_function("raise_exception", |msg: String| -> Result<Value, Error> {
        Err(invalid(msg))
    });
    env.add_function("toJson", to_json);
}
