//! C ABI shims that keep a translated library a drop-in replacement.
//!
//! For every exported symbol of the original library, `src/wrapper.rs`
//! gets an `extern "C"` function with the original name:
//!
//! - if the translation already exports it (`#[no_mangle] extern "C"`),
//!   nothing is generated;
//! - if the translation has a `pub fn` of that name, the shim forwards to it;
//! - otherwise the shim panics with "unimplemented" when called.
//!
//! Arity or type mismatches between the C prototype and the translated
//! function are synthesis errors. They are reported and the symbol falls back to an
//! unimplemented shim, so the library still links.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::target::Target;
use crate::workdir::WorkDir;

/// A C function prototype recovered from preprocessed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CPrototype {
    pub name: String,
    /// `None` for `void`.
    pub ret: Option<String>,
    pub params: Vec<String>,
    pub variadic: bool,
}

/// A `pub fn` found in the translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RustFn {
    pub name: String,
    pub params: Vec<String>,
    pub ret: Option<String>,
    pub is_unsafe: bool,
    /// Already exported with the C ABI under its own name.
    pub exported: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShimKind {
    Native,
    Forward,
    Unimplemented,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShimEntry {
    pub symbol: String,
    pub kind: ShimKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SynthesisError {
    pub symbol: String,
    pub reason: String,
}

/// Persisted as `wrapper.json`; `source` goes to `src/wrapper.rs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrapperArtifact {
    pub target: String,
    pub shims: Vec<ShimEntry>,
    pub errors: Vec<SynthesisError>,
    #[serde(skip)]
    pub source: String,
}

impl WrapperArtifact {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn write(&self, workdir: &WorkDir) -> Result<()> {
        std::fs::write(workdir.wrapper_source(), &self.source)?;
        std::fs::write(workdir.wrapper_record(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(workdir: &WorkDir) -> Result<Option<Self>> {
        match std::fs::read_to_string(workdir.wrapper_record()) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn rust_fn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?m)^(?P<attrs>(?:[ \t]*#\[[^\]]*\][ \t]*\r?\n)*)[ \t]*pub[ \t]+(?P<unsafe>unsafe[ \t]+)?(?P<abi>extern[ \t]+"C"[ \t]+)?fn[ \t]+(?P<name>[A-Za-z_][A-Za-z0-9_]*)[ \t]*(?:<[^>]*>)?[ \t]*\("#,
        )
        .expect("static regex")
    })
}

/// Split at top-level commas, ignoring those nested in brackets.
fn split_params(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' | '<' | '[' | '{' => depth += 1,
            ')' | '>' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Text between the parenthesis at `open` and its partner, plus the index
/// just past the closing one.
fn balanced(source: &str, open: usize) -> Option<(&str, usize)> {
    let mut depth = 0usize;
    for (i, c) in source[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&source[open + 1..open + i], open + i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Every public free function in `source`, keyed by name.
pub fn scan_rust_fns(source: &str) -> BTreeMap<String, RustFn> {
    let mut fns = BTreeMap::new();
    for caps in rust_fn_regex().captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        let Some((params, after)) = balanced(source, whole.end() - 1) else {
            continue;
        };
        let tail = source[after..].trim_start();
        let ret = tail.strip_prefix("->").map(|r| {
            let end = r.find(|c| c == '{' || c == ';').unwrap_or(r.len());
            let r = r[..end].trim();
            r.split(" where ").next().unwrap_or(r).trim().to_string()
        });
        let attrs = caps.name("attrs").map(|m| m.as_str()).unwrap_or("");
        let name = caps["name"].to_string();
        fns.insert(
            name.clone(),
            RustFn {
                name,
                params: split_params(params)
                    .into_iter()
                    .filter(|p| !p.contains("self"))
                    .map(|p| p.split_once(':').map(|(_, ty)| ty.trim().to_string()).unwrap_or(p))
                    .collect(),
                ret: ret.filter(|r| r != "()"),
                is_unsafe: caps.name("unsafe").is_some(),
                exported: caps.name("abi").is_some() && attrs.contains("no_mangle"),
            },
        );
    }
    fns
}

const STORAGE_WORDS: &[&str] = &["extern", "static", "inline", "__inline", "__inline__", "__extension__"];
const TYPE_WORDS: &[&str] = &[
    "void", "char", "short", "int", "long", "float", "double", "signed", "unsigned", "const",
    "volatile", "_Bool", "bool", "struct", "union", "enum", "restrict", "__restrict",
];

/// Drop a trailing parameter name: `const char *s` -> `const char *`.
fn param_type(param: &str) -> String {
    let param = param.replace('*', " * ");
    let mut tokens: Vec<&str> = param.split_whitespace().collect();
    let array = tokens.last().is_some_and(|t| t.contains('['));
    if array {
        if let Some(last) = tokens.pop() {
            let name = last.split('[').next().unwrap_or("");
            if !name.is_empty() {
                tokens.push(name);
            }
        }
    }
    let tagged = tokens.len() == 2 && matches!(tokens[0], "struct" | "union" | "enum");
    if tokens.len() > 1 && !tagged {
        if let Some(last) = tokens.last() {
            let ident = last.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if ident && *last != "*" && !TYPE_WORDS.contains(last) && !last.ends_with("_t") {
                tokens.pop();
            }
        }
    }
    let mut ty = tokens.join(" ").replace(" *", "*").replace("* ", "*");
    if array {
        ty.push('*');
    }
    ty
}

/// Find the prototype of each requested symbol in preprocessed C source.
pub fn parse_c_prototypes(source: &str, names: &[String]) -> BTreeMap<String, CPrototype> {
    let mut found = BTreeMap::new();
    for name in names {
        let pattern = format!(
            r"(?m)^[ \t]*(?P<ret>(?:[A-Za-z_][A-Za-z0-9_]*[\s\*]+)+?){}\s*\((?P<params>[^;{{)]*(?:\([^)]*\)[^;{{)]*)*)\)\s*[;{{]",
            regex::escape(name)
        );
        let Ok(re) = Regex::new(&pattern) else { continue };
        let Some(caps) = re.captures(source) else { continue };

        let ret_words: Vec<&str> = caps["ret"]
            .split_whitespace()
            .filter(|w| !STORAGE_WORDS.contains(w))
            .collect();
        let ret = ret_words.join(" ").replace(" *", "*");
        let raw_params = split_params(&caps["params"]);
        let variadic = raw_params.iter().any(|p| p == "...");
        let params = raw_params
            .iter()
            .filter(|p| p.as_str() != "..." && p.as_str() != "void")
            .map(|p| param_type(p))
            .collect();
        found.insert(
            name.clone(),
            CPrototype {
                name: name.clone(),
                ret: (ret != "void").then_some(ret),
                params,
                variadic,
            },
        );
    }
    found
}

/// Map a C type onto its `std::os::raw`/core equivalent. `None` for types
/// that cannot cross the boundary by value.
pub fn c_type_to_rust(ty: &str) -> Option<String> {
    let ty = ty.trim();
    if let Some(inner) = ty.strip_suffix('*') {
        let inner = inner.trim();
        let (is_const, base) = match inner.strip_prefix("const") {
            Some(rest) => (true, rest.trim()),
            None => (false, inner.trim_end_matches("const").trim()),
        };
        let pointee = match base {
            "void" => "std::os::raw::c_void".to_string(),
            other => c_type_to_rust(other).unwrap_or_else(|| "std::os::raw::c_void".to_string()),
        };
        let ptr = if is_const { "*const" } else { "*mut" };
        return Some(format!("{ptr} {pointee}"));
    }

    let words: Vec<&str> = ty
        .split_whitespace()
        .filter(|w| !matches!(*w, "const" | "volatile" | "signed" | "register"))
        .collect();
    let unsigned = ty.split_whitespace().any(|w| w == "unsigned");
    let plain: Vec<&str> = words.into_iter().filter(|w| *w != "unsigned").collect();
    let raw = |s: &str| Some(format!("std::os::raw::{s}"));

    match (unsigned, plain.as_slice()) {
        (false, ["char"]) if ty.contains("signed") => raw("c_schar"),
        (false, ["char"]) => raw("c_char"),
        (true, ["char"]) => raw("c_uchar"),
        (false, ["short"] | ["short", "int"]) => raw("c_short"),
        (true, ["short"] | ["short", "int"]) => raw("c_ushort"),
        (false, [] | ["int"]) => raw("c_int"),
        (true, [] | ["int"]) => raw("c_uint"),
        (false, ["long"] | ["long", "int"]) => raw("c_long"),
        (true, ["long"] | ["long", "int"]) => raw("c_ulong"),
        (false, ["long", "long"] | ["long", "long", "int"]) => raw("c_longlong"),
        (true, ["long", "long"] | ["long", "long", "int"]) => raw("c_ulonglong"),
        (false, ["float"]) => raw("c_float"),
        (false, ["double"]) => raw("c_double"),
        (false, ["_Bool"] | ["bool"]) => Some("bool".into()),
        (false, ["size_t"]) => Some("usize".into()),
        (false, ["ssize_t"] | ["ptrdiff_t"] | ["intptr_t"]) => Some("isize".into()),
        (false, ["uintptr_t"]) => Some("usize".into()),
        (false, [fixed]) => fixed_width(fixed),
        _ => None,
    }
}

fn fixed_width(ty: &str) -> Option<String> {
    let (signed, bits) = match ty.strip_prefix("uint") {
        Some(rest) => (false, rest),
        None => (true, ty.strip_prefix("int")?),
    };
    let bits = bits.strip_suffix("_t")?;
    matches!(bits, "8" | "16" | "32" | "64").then(|| format!("{}{bits}", if signed { "i" } else { "u" }))
}

fn is_numeric(rust_ty: &str) -> bool {
    let ty = rust_ty.trim_start_matches("std::os::raw::").trim_start_matches("core::ffi::").trim_start_matches("libc::");
    matches!(
        ty,
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" | "f32" | "f64"
    ) || ty.starts_with("c_") && ty != "c_void"
}

struct ShimSignature {
    params: Vec<String>,
    ret: Option<String>,
}

fn signature_from_c(proto: &CPrototype) -> std::result::Result<ShimSignature, String> {
    if proto.variadic {
        return Err("variadic functions cannot be defined in Rust".into());
    }
    let mut params = Vec::new();
    for p in &proto.params {
        params.push(c_type_to_rust(p).ok_or_else(|| format!("parameter type `{p}` has no FFI-safe mapping"))?);
    }
    let ret = match &proto.ret {
        Some(r) => Some(c_type_to_rust(r).ok_or_else(|| format!("return type `{r}` has no FFI-safe mapping"))?),
        None => None,
    };
    Ok(ShimSignature { params, ret })
}

fn write_header(out: &mut String, symbol: &str, sig: &ShimSignature, unused: bool) {
    let prefix = if unused { "_a" } else { "a" };
    let params: Vec<String> = sig
        .params
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("{prefix}{i}: {ty}"))
        .collect();
    let _ = write!(out, "#[no_mangle]\npub extern \"C\" fn {symbol}({})", params.join(", "));
    if let Some(ret) = &sig.ret {
        let _ = write!(out, " -> {ret}");
    }
    out.push_str(" {\n");
}

fn write_unimplemented(out: &mut String, symbol: &str, sig: &ShimSignature) {
    write_header(out, symbol, sig, true);
    let _ = writeln!(out, "    unimplemented!(\"{symbol} has no translated implementation\")\n}}\n");
}

fn is_pointer(rust_ty: &str) -> bool {
    rust_ty.starts_with("*const ") || rust_ty.starts_with("*mut ")
}

/// Whether a value of C-side type `c_ty` can be handed to (or taken from)
/// the translated side's `r_ty`, with at most an `as` cast.
fn compatible(c_ty: &str, r_ty: &str) -> bool {
    c_ty == r_ty
        || (is_numeric(c_ty) && is_numeric(r_ty))
        || (is_pointer(c_ty) && is_pointer(r_ty))
}

fn needs_cast(c_ty: &str, r_ty: &str) -> bool {
    c_ty != r_ty && compatible(c_ty, r_ty)
}

/// Why `target` cannot be called through `sig`, if it cannot.
fn signature_mismatch(sig: &ShimSignature, target: &RustFn) -> Option<String> {
    if sig.params.len() != target.params.len() {
        return Some(format!(
            "C prototype takes {} parameters, translated function takes {}",
            sig.params.len(),
            target.params.len()
        ));
    }
    for (i, (c_ty, r_ty)) in sig.params.iter().zip(&target.params).enumerate() {
        if !compatible(c_ty, r_ty) {
            return Some(format!("parameter {i}: C type `{c_ty}` cannot be passed as `{r_ty}`"));
        }
    }
    match (&sig.ret, &target.ret) {
        (Some(c_ret), Some(r_ret)) if !compatible(c_ret, r_ret) => {
            Some(format!("return type `{r_ret}` cannot be returned as `{c_ret}`"))
        }
        (Some(c_ret), None) => Some(format!("C prototype returns `{c_ret}`, translated function returns nothing")),
        (None, Some(r_ret)) => Some(format!("C prototype returns void, translated function returns `{r_ret}`")),
        _ => None,
    }
}

fn write_forward(out: &mut String, symbol: &str, sig: &ShimSignature, target: &RustFn) {
    write_header(out, symbol, sig, false);
    let args: Vec<String> = sig
        .params
        .iter()
        .zip(&target.params)
        .enumerate()
        .map(|(i, (c_ty, r_ty))| {
            if needs_cast(c_ty, r_ty) {
                format!("a{i} as {r_ty}")
            } else {
                format!("a{i}")
            }
        })
        .collect();
    let mut call = format!("crate::{}({})", target.name, args.join(", "));
    if target.is_unsafe {
        call = format!("(unsafe {{ {call} }})");
    }
    match (&sig.ret, &target.ret) {
        (Some(c_ret), Some(r_ret)) if needs_cast(c_ret, r_ret) => {
            let _ = writeln!(out, "    {call} as {c_ret}");
        }
        (Some(_), _) => {
            let _ = writeln!(out, "    {call}");
        }
        (None, _) => {
            let _ = writeln!(out, "    {call};");
        }
    }
    out.push_str("}\n\n");
}

/// Generate the wrapper module for `target` from its translation and the
/// concatenated preprocessed C sources.
pub fn synthesize(target: &Target, translation: &str, c_source: &str) -> WrapperArtifact {
    let prototypes = parse_c_prototypes(c_source, &target.exported_symbols);
    let translated = scan_rust_fns(translation);

    let mut artifact = WrapperArtifact {
        target: target.name.clone(),
        shims: Vec::new(),
        errors: Vec::new(),
        source: String::new(),
    };
    let mut out = String::from("//! C ABI entry points generated by recast.\n\n");

    for symbol in &target.exported_symbols {
        let fail = |reason: String| SynthesisError {
            symbol: symbol.clone(),
            reason,
        };
        let rust_fn = translated.get(symbol);
        if rust_fn.is_some_and(|f| f.exported) {
            artifact.shims.push(ShimEntry { symbol: symbol.clone(), kind: ShimKind::Native });
            continue;
        }

        let sig = match prototypes.get(symbol) {
            Some(proto) => match signature_from_c(proto) {
                Ok(sig) => sig,
                Err(reason) => {
                    artifact.errors.push(fail(reason));
                    continue;
                }
            },
            None => match rust_fn {
                Some(f) => ShimSignature { params: f.params.clone(), ret: f.ret.clone() },
                None => {
                    artifact.errors.push(fail("no C prototype and no translated function".into()));
                    continue;
                }
            },
        };

        match rust_fn.map(|f| (f, signature_mismatch(&sig, f))) {
            Some((f, None)) => {
                write_forward(&mut out, symbol, &sig, f);
                artifact.shims.push(ShimEntry { symbol: symbol.clone(), kind: ShimKind::Forward });
            }
            Some((_, Some(reason))) => {
                artifact.errors.push(fail(reason));
                write_unimplemented(&mut out, symbol, &sig);
                artifact.shims.push(ShimEntry { symbol: symbol.clone(), kind: ShimKind::Unimplemented });
            }
            None => {
                write_unimplemented(&mut out, symbol, &sig);
                artifact.shims.push(ShimEntry { symbol: symbol.clone(), kind: ShimKind::Unimplemented });
            }
        }
    }

    artifact.source = out;
    artifact
}
