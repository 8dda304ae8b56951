use std::os::raw::c_char;
use std::sync::Mutex;

use log::debug;
use schnellru::{ByLength, LruMap};

/// Maximum recursion depth for the mangled-grammar parser; anything deeper
/// is treated as pathological and returned raw.
const MAX_DEPTH: usize = 10;

const CACHE_LIMIT: u32 = 65_536;

/// External-process fallback: receives newline-separated mangled names,
/// returns newline-separated demangled results.
pub type ProcessDelegate = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// `swift_demangle(name, name_len, out_buf, &out_len, flags)` as exported
/// by libswiftCore.
pub type SwiftDemangleFn =
    unsafe extern "C" fn(*const c_char, usize, *mut c_char, *mut usize, u32) -> *mut c_char;

/// Swift name demangler with a memoized cache.
///
/// The built-in parser covers the type manglings that show up in class
/// metadata and reflection fields. Both delegates are optional; when they
/// are absent or produce output the validator rejects, the built-in result
/// (or the raw input) is used instead.
pub struct Demangler {
    cache: Mutex<LruMap<String, String, ByLength>>,
    process_delegate: Option<ProcessDelegate>,
    symbol_delegate: Option<SwiftDemangleFn>,
}

impl Default for Demangler {
    fn default() -> Self {
        Demangler::new()
    }
}

impl Demangler {
    pub fn new() -> Self {
        Demangler {
            cache: Mutex::new(LruMap::new(ByLength::new(CACHE_LIMIT))),
            process_delegate: None,
            symbol_delegate: None,
        }
    }

    pub fn with_process_delegate(mut self, delegate: ProcessDelegate) -> Self {
        self.process_delegate = Some(delegate);
        self
    }

    /// # Safety contract
    ///
    /// `delegate` must follow the `swift_demangle` ABI; it is invoked with
    /// a NUL-terminated name and a caller-owned buffer.
    pub fn with_symbol_delegate(mut self, delegate: SwiftDemangleFn) -> Self {
        self.symbol_delegate = Some(delegate);
        self
    }

    pub fn demangle(&self, name: &str) -> String {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(name) {
                return hit.clone();
            }
        }

        let result = self
            .delegate_demangle(name)
            .filter(|out| is_plausible_demangle(out))
            .or_else(|| demangle_builtin(name).filter(|out| is_plausible_demangle(out)))
            .unwrap_or_else(|| name.to_string());

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), result.clone());
        }
        result
    }

    /// Demangle a batch, preferring one round trip through the process
    /// delegate when it is installed.
    pub fn demangle_batch(&self, names: &[&str]) -> Vec<String> {
        if let Some(delegate) = &self.process_delegate {
            let joined = names.join("\n");
            if let Some(output) = delegate(&joined) {
                let lines: Vec<&str> = output.lines().collect();
                if lines.len() == names.len() {
                    return names
                        .iter()
                        .zip(lines)
                        .map(|(name, line)| {
                            if is_plausible_demangle(line) {
                                line.to_string()
                            } else {
                                self.demangle(name)
                            }
                        })
                        .collect();
                }
                debug!("process demangler returned {} lines for {} names", lines.len(), names.len());
            }
        }
        names.iter().map(|name| self.demangle(name)).collect()
    }

    fn delegate_demangle(&self, name: &str) -> Option<String> {
        if let Some(delegate) = &self.process_delegate {
            if let Some(out) = delegate(name) {
                let out = out.trim().to_string();
                if !out.is_empty() && out != name {
                    return Some(out);
                }
            }
        }
        if let Some(symbol) = self.symbol_delegate {
            let mut input: Vec<u8> = name.as_bytes().to_vec();
            input.push(0);
            let mut buf = vec![0u8; 4096];
            let mut buf_len = buf.len();
            let out = unsafe {
                symbol(
                    input.as_ptr() as *const c_char,
                    name.len(),
                    buf.as_mut_ptr() as *mut c_char,
                    &mut buf_len as *mut usize,
                    0,
                )
            };
            if !out.is_null() && buf_len > 0 && buf_len <= buf.len() {
                let end = buf[..buf_len].iter().position(|b| *b == 0).unwrap_or(buf_len);
                if let Ok(s) = std::str::from_utf8(&buf[..end]) {
                    if !s.is_empty() && s != name {
                        return Some(s.to_string());
                    }
                }
            }
        }
        None
    }
}

/// Does `name` carry a mangling prefix the built-in parser understands?
pub fn is_mangled(name: &str) -> bool {
    let bytes = name.as_bytes();
    name.starts_with("_Tt")
        || name.starts_with("_T0")
        || name.starts_with("_$s")
        || name.starts_with("$s")
        || (name.starts_with("_T") && bytes.len() > 2)
        || (name.starts_with("So") && bytes.get(2).is_some_and(|b| b.is_ascii_digit()))
        || (name.starts_with("Ss") && bytes.get(2).is_some_and(|b| b.is_ascii_digit()))
        || (bytes.first() == Some(&b'S') && bytes.len() >= 2 && !bytes[1].is_ascii_lowercase())
}

/// The built-in demangler. Returns `None` when the input is not recognized
/// or only partially parses.
pub fn demangle_builtin(name: &str) -> Option<String> {
    if let Some(rest) = name.strip_prefix("_Tt") {
        return demangle_type(rest);
    }
    if let Some(rest) = name
        .strip_prefix("_$s")
        .or_else(|| name.strip_prefix("$s"))
        .or_else(|| name.strip_prefix("_T0"))
    {
        return demangle_type(rest);
    }
    if name.starts_with("So") || name.starts_with("Ss") {
        if name.as_bytes().get(2).is_some_and(|b| b.is_ascii_digit()) {
            return demangle_type(name);
        }
        return None;
    }
    if let Some(rest) = name.strip_prefix("_T") {
        return demangle_type(rest);
    }
    // Bare shortcut forms such as `SS` or `SaySSG` found in field
    // metadata.
    if name.as_bytes().first() == Some(&b'S') {
        return demangle_type(name);
    }
    None
}

fn demangle_type(rest: &str) -> Option<String> {
    let mut parser = Mangled::new(rest);
    let ty = parser.parse_type(0)?;
    if !parser.finished() {
        return None;
    }
    Some(ty)
}

struct Mangled<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Mangled<'a> {
    fn new(s: &'a str) -> Self {
        Mangled {
            bytes: s.as_bytes(),
            pos: 0,
        }
    }

    fn finished(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.bytes[self.pos..].starts_with(s.as_bytes()) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    /// One `<len><name>` run.
    fn read_len_name(&mut self) -> Option<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let len: usize = std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()?
            .parse()
            .ok()?;
        if len == 0 || self.pos + len > self.bytes.len() {
            return None;
        }
        let name = std::str::from_utf8(&self.bytes[self.pos..self.pos + len]).ok()?;
        self.pos += len;
        Some(name.to_string())
    }

    /// Consecutive `<len><name>` runs joined with dots, private
    /// discriminators dropped.
    fn read_name_path(&mut self) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        loop {
            match self.peek() {
                Some(b'0'..=b'9') => {
                    let segment = self.read_len_name()?;
                    if !is_private_discriminator(&segment) {
                        parts.push(segment);
                    }
                }
                // A `P33_<hex>` private-scope marker between segments.
                Some(b'P')
                    if self
                        .bytes
                        .get(self.pos + 1)
                        .is_some_and(|b| b.is_ascii_digit()) =>
                {
                    self.bump();
                }
                _ => break,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("."))
    }

    fn parse_type(&mut self, depth: usize) -> Option<String> {
        if depth > MAX_DEPTH {
            return None;
        }
        let base = match self.peek()? {
            b'0'..=b'9' => {
                let path = self.read_name_path()?;
                // A nominal-type kind marker may trail the path.
                if matches!(
                    self.peek(),
                    Some(b'C') | Some(b'V') | Some(b'O') | Some(b'P')
                ) && self.remaining_is_suffix_like()
                {
                    self.bump();
                }
                path
            }
            b'C' | b'V' | b'O' => {
                // Repeated container prefixes indicate nesting; the
                // segments that follow name each level outside-in.
                while matches!(self.peek(), Some(b'C') | Some(b'V') | Some(b'O')) {
                    self.bump();
                }
                self.read_name_path()?
            }
            b'P' => {
                self.bump();
                if self.peek() == Some(b'M') {
                    // Metatype wrapper, not a protocol list.
                    self.bump();
                    let inner = self.parse_type(depth + 1)?;
                    format!("{inner}.Type")
                } else {
                    let path = self.read_name_path()?;
                    self.eat(b'_');
                    path
                }
            }
            b'G' => {
                self.bump();
                let base = self.parse_type(depth + 1)?;
                let mut args = Vec::new();
                while !self.finished() && self.peek() != Some(b'_') {
                    args.push(self.parse_type(depth + 1)?);
                }
                self.eat(b'_');
                if args.is_empty() {
                    base
                } else {
                    format!("{base}<{}>", args.join(", "))
                }
            }
            b'S' => self.parse_shortcut(depth)?,
            _ => return None,
        };
        self.apply_suffixes(base, depth)
    }

    /// True when the characters after a candidate kind marker can only be
    /// suffixes, so the marker is safe to consume.
    fn remaining_is_suffix_like(&self) -> bool {
        let rest = &self.bytes[self.pos + 1..];
        rest.is_empty()
            || rest.starts_with(b"Sg")
            || rest.starts_with(b"Sq")
            || rest.starts_with(b"_p")
            || rest.starts_with(b"y")
    }

    fn apply_suffixes(&mut self, mut out: String, depth: usize) -> Option<String> {
        loop {
            if self.eat_str("Sg") || self.eat_str("Sq") {
                out = format!("{out}?");
            } else if self.eat_str("_p") {
                out = format!("any {out}");
            } else if self.eat(b'y') {
                // Trailing generic argument list: `y<args>G`.
                let mut args = Vec::new();
                while !self.finished() && self.peek() != Some(b'G') {
                    args.push(self.parse_type(depth + 1)?);
                }
                if !self.eat(b'G') {
                    return None;
                }
                if !args.is_empty() {
                    out = format!("{out}<{}>", args.join(", "));
                }
            } else {
                break;
            }
        }
        Some(out)
    }

    fn parse_shortcut(&mut self, depth: usize) -> Option<String> {
        self.bump(); // the 'S'
        let selector = self.bump()?;
        let shortcut = match selector {
            b'S' => "String",
            b'i' => "Int",
            b'b' => "Bool",
            b'd' => "Double",
            b'f' => "Float",
            b'u' => "UInt",
            b'a' => return self.bracketed_generic(depth, BracketForm::Array),
            b'D' => return self.bracketed_generic(depth, BracketForm::Dictionary),
            b'h' => return self.named_generic(depth, "Set"),
            b'g' | b'q' => {
                // Optional spelled as a container: `Sqy<T>G` or `SgyTG`.
                if self.eat(b'y') {
                    let inner = self.parse_type(depth + 1)?;
                    self.eat(b'G');
                    return Some(format!("{inner}?"));
                }
                "Optional"
            }
            b'c' => return self.parse_concurrency(depth),
            b'o' => {
                // ObjC-imported type: `So8NSStringC`.
                let path = self.read_name_path()?;
                if matches!(self.peek(), Some(b'C') | Some(b'V') | Some(b'O')) {
                    self.bump();
                }
                return Some(path);
            }
            b's' => {
                // Swift stdlib namespace.
                if matches!(self.peek(), Some(b'0'..=b'9')) {
                    let path = self.read_name_path()?;
                    return Some(path);
                }
                "Swift"
            }
            _ => return None,
        };
        Some(shortcut.to_string())
    }

    fn bracketed_generic(&mut self, depth: usize, form: BracketForm) -> Option<String> {
        if !self.eat(b'y') {
            // Unapplied container name.
            return Some(
                match form {
                    BracketForm::Array => "Array",
                    BracketForm::Dictionary => "Dictionary",
                }
                .to_string(),
            );
        }
        match form {
            BracketForm::Array => {
                let element = self.parse_type(depth + 1)?;
                if !self.eat(b'G') {
                    return None;
                }
                Some(format!("[{element}]"))
            }
            BracketForm::Dictionary => {
                let key = self.parse_type(depth + 1)?;
                let value = self.parse_type(depth + 1)?;
                if !self.eat(b'G') {
                    return None;
                }
                Some(format!("[{key}: {value}]"))
            }
        }
    }

    fn named_generic(&mut self, depth: usize, name: &str) -> Option<String> {
        if !self.eat(b'y') {
            return Some(name.to_string());
        }
        let mut args = Vec::new();
        while !self.finished() && self.peek() != Some(b'G') {
            args.push(self.parse_type(depth + 1)?);
        }
        if !self.eat(b'G') {
            return None;
        }
        Some(format!("{name}<{}>", args.join(", ")))
    }

    fn parse_concurrency(&mut self, depth: usize) -> Option<String> {
        let which = self.bump()?;
        let name = match which {
            b'T' => return self.named_generic(depth, "Task"),
            b'C' => "CheckedContinuation",
            b'U' => "UnsafeContinuation",
            b'A' => "Actor",
            b'M' => "MainActor",
            b'S' => "AsyncStream",
            b'F' => "AsyncThrowingStream",
            b'g' => "TaskGroup",
            b'G' => "ThrowingTaskGroup",
            b'P' => "TaskPriority",
            _ => return None,
        };
        self.named_generic(depth, name)
    }
}

enum BracketForm {
    Array,
    Dictionary,
}

/// `_<32 hex digits>` segments are private-type discriminators.
fn is_private_discriminator(segment: &str) -> bool {
    segment.len() == 33
        && segment.starts_with('_')
        && segment[1..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Post-pass validation: a partially demangled result (stray mangling
/// bytes, unbalanced brackets) must be rejected so the raw name falls
/// through instead.
pub fn is_plausible_demangle(out: &str) -> bool {
    if out.is_empty() {
        return false;
    }
    let mut angle = 0i32;
    let mut square = 0i32;
    let mut paren = 0i32;
    for c in out.chars() {
        if !(' '..='~').contains(&c) {
            return false;
        }
        match c {
            '<' => angle += 1,
            '>' => {
                angle -= 1;
                if angle < 0 {
                    return false;
                }
            }
            '[' => square += 1,
            ']' => {
                square -= 1;
                if square < 0 {
                    return false;
                }
            }
            '(' => paren += 1,
            ')' => {
                paren -= 1;
                if paren < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    angle == 0 && square == 0 && paren == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demangle(name: &str) -> String {
        Demangler::new().demangle(name)
    }

    #[test]
    fn plain_class_names() {
        assert_eq!(demangle("_TtC10ModuleName7MyClass"), "ModuleName.MyClass");
        assert_eq!(demangle("_TtV10ModuleName5Point"), "ModuleName.Point");
        assert_eq!(demangle("_TtO4Mood5State"), "Mood.State");
    }

    #[test]
    fn nested_containers() {
        assert_eq!(
            demangle("_TtCC10ModuleName5Outer5Inner"),
            "ModuleName.Outer.Inner"
        );
        assert_eq!(
            demangle("_TtCCC3App1A1B1C"),
            "App.A.B.C"
        );
    }

    #[test]
    fn generic_forms() {
        assert_eq!(
            demangle("_TtGC10ModuleName9ContainerSS_"),
            "ModuleName.Container<String>"
        );
        assert_eq!(
            demangle("_TtGC10ModuleName7PairMapSSSi_"),
            "ModuleName.PairMap<String, Int>"
        );
        assert_eq!(demangle("_TtSDySSSiG"), "[String: Int]");
        assert_eq!(demangle("_TtSSSg"), "String?");
        assert_eq!(demangle("_TtSaySSG"), "[String]");
        assert_eq!(demangle("_TtShySiG"), "Set<Int>");
        assert_eq!(demangle("_TtSqySdG"), "Double?");
    }

    #[test]
    fn concurrency_types() {
        assert_eq!(demangle("_TtScTySS_s5Error_pG"), "_TtScTySS_s5Error_pG");
        assert_eq!(demangle("_TtScM"), "MainActor");
        assert_eq!(demangle("_TtScA"), "Actor");
        assert_eq!(demangle("_TtScP"), "TaskPriority");
        assert_eq!(demangle("_TtScTySSSiG"), "Task<String, Int>");
        assert_eq!(demangle("_TtScSySSG"), "AsyncStream<String>");
    }

    #[test]
    fn dollar_s_forms() {
        assert_eq!(demangle("$s10Foundation4DateV"), "Foundation.Date");
        assert_eq!(demangle("_$s10Foundation3URLV"), "Foundation.URL");
        assert_eq!(demangle("$sSS"), "String");
        assert_eq!(demangle("$sSiSg"), "Int?");
        assert_eq!(demangle("$sSaySiG"), "[Int]");
    }

    #[test]
    fn objc_imported_and_stdlib() {
        assert_eq!(demangle("So8NSStringC"), "NSString");
        assert_eq!(demangle("Ss10Collection"), "Collection");
    }

    #[test]
    fn protocol_existential() {
        assert_eq!(demangle("_TtP7Combine9Publisher_"), "Combine.Publisher");
        assert_eq!(demangle("$s7Combine9PublisherP_p"), "any Combine.Publisher");
    }

    #[test]
    fn private_discriminators_are_dropped() {
        assert_eq!(
            demangle("_TtC5MyAppP33_0123456789ABCDEF0123456789ABCDEF6Hidden"),
            "MyApp.Hidden"
        );
    }

    #[test]
    fn unrecognized_returns_raw() {
        assert_eq!(demangle("NSObject"), "NSObject");
        assert_eq!(demangle("Something"), "Something");
        assert_eq!(demangle("_Tt"), "_Tt");
        // Truncated length run: parse fails, raw name survives.
        assert_eq!(demangle("_TtC10Modu"), "_TtC10Modu");
    }

    #[test]
    fn idempotence() {
        for name in [
            "_TtGC10ModuleName9ContainerSS_",
            "_TtSDySSSiG",
            "_TtSSSg",
            "_TtC10ModuleName7MyClass",
            "$s10Foundation4DateV",
        ] {
            let once = demangle(name);
            assert_ne!(once, name);
            assert_eq!(demangle(&once), once);
        }
    }

    #[test]
    fn validator_rejects_partial_output() {
        assert!(!is_plausible_demangle(""));
        assert!(!is_plausible_demangle("Foo<Bar"));
        assert!(!is_plausible_demangle("Foo]"));
        assert!(!is_plausible_demangle("Bad\u{1}Name"));
        assert!(is_plausible_demangle("ModuleName.Container<String>"));
        assert!(is_plausible_demangle("[String: Int]"));
    }

    #[test]
    fn cache_memoizes() {
        let demangler = Demangler::new();
        let first = demangler.demangle("_TtSaySSG");
        let second = demangler.demangle("_TtSaySSG");
        assert_eq!(first, "[String]");
        assert_eq!(first, second);
    }

    #[test]
    fn process_delegate_wins_when_valid() {
        let demangler = Demangler::new().with_process_delegate(Box::new(|name: &str| {
            if name == "_TtC3App4Main" {
                Some("App.MainDelegateResult".to_string())
            } else {
                None
            }
        }));
        assert_eq!(demangler.demangle("_TtC3App4Main"), "App.MainDelegateResult");
        // Delegate misses fall back to the built-in parser.
        assert_eq!(demangler.demangle("_TtSSSg"), "String?");
    }

    #[test]
    fn delegate_garbage_falls_back() {
        let demangler = Demangler::new()
            .with_process_delegate(Box::new(|_| Some("broken<output".to_string())));
        assert_eq!(demangler.demangle("_TtSaySiG"), "[Int]");
    }
}
