use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use schnellru::{ByLength, LruMap};

use crate::error::{DumpError, DumpResult};

/// Ownership/dispatch modifiers that may prefix any type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Const,    // r
    In,       // n
    Inout,    // N
    Out,      // o
    Bycopy,   // O
    Byref,    // R
    Oneway,   // V
    Atomic,   // A
    Complex,  // j
}

impl Modifier {
    fn from_byte(byte: u8) -> Option<Modifier> {
        match byte {
            b'r' => Some(Modifier::Const),
            b'n' => Some(Modifier::In),
            b'N' => Some(Modifier::Inout),
            b'o' => Some(Modifier::Out),
            b'O' => Some(Modifier::Bycopy),
            b'R' => Some(Modifier::Byref),
            b'V' => Some(Modifier::Oneway),
            b'A' => Some(Modifier::Atomic),
            b'j' => Some(Modifier::Complex),
            _ => None,
        }
    }

    pub fn encode(&self) -> char {
        match self {
            Modifier::Const => 'r',
            Modifier::In => 'n',
            Modifier::Inout => 'N',
            Modifier::Out => 'o',
            Modifier::Bycopy => 'O',
            Modifier::Byref => 'R',
            Modifier::Oneway => 'V',
            Modifier::Atomic => 'A',
            Modifier::Complex => 'j',
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Modifier::Const => "const",
            Modifier::In => "in",
            Modifier::Inout => "inout",
            Modifier::Out => "out",
            Modifier::Bycopy => "bycopy",
            Modifier::Byref => "byref",
            Modifier::Oneway => "oneway",
            Modifier::Atomic => "_Atomic",
            Modifier::Complex => "_Complex",
        }
    }
}

/// One member of a struct or union; the quoted name is optional in the
/// encoding and its absence must survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: Option<String>,
    pub ty: ObjCType,
}

/// A type plus the trailing stack offset that method encodings carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureItem {
    pub ty: ObjCType,
    pub offset: Option<u64>,
}

/// A method (or block) signature: return type first, then the arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTypeList {
    pub items: Vec<SignatureItem>,
}

impl MethodTypeList {
    pub fn return_type(&self) -> Option<&ObjCType> {
        self.items.first().map(|item| &item.ty)
    }

    /// Arguments after the implicit self and _cmd slots.
    pub fn method_args(&self) -> &[SignatureItem] {
        if self.items.len() > 3 {
            &self.items[3..]
        } else {
            &[]
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            out.push_str(&item.ty.encode());
            if let Some(offset) = item.offset {
                out.push_str(&offset.to_string());
            }
        }
        out
    }
}

/// The parsed form of one `@encode` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjCType {
    Char,
    Int,
    Short,
    Long,
    LongLong,
    Int128,
    UChar,
    UInt,
    UShort,
    ULong,
    ULongLong,
    UInt128,
    Float,
    Double,
    LongDouble,
    Bool,
    Void,
    CString,
    Class,
    Sel,
    Atom,
    Unknown,
    Id {
        class: Option<String>,
        protocols: Vec<String>,
    },
    Block {
        signature: Option<MethodTypeList>,
    },
    Pointer(Box<ObjCType>),
    Array {
        len: u64,
        element: Box<ObjCType>,
    },
    Struct {
        name: String,
        members: Option<Vec<Member>>,
    },
    Union {
        name: String,
        members: Option<Vec<Member>>,
    },
    Bitfield(u32),
    Modified {
        modifiers: Vec<Modifier>,
        ty: Box<ObjCType>,
    },
}

impl ObjCType {
    pub fn is_block(&self) -> bool {
        match self {
            ObjCType::Block { .. } => true,
            ObjCType::Modified { ty, .. } => ty.is_block(),
            _ => false,
        }
    }

    /// Re-emit the canonical encoding string.
    pub fn encode(&self) -> String {
        match self {
            ObjCType::Char => "c".into(),
            ObjCType::Int => "i".into(),
            ObjCType::Short => "s".into(),
            ObjCType::Long => "l".into(),
            ObjCType::LongLong => "q".into(),
            ObjCType::Int128 => "t".into(),
            ObjCType::UChar => "C".into(),
            ObjCType::UInt => "I".into(),
            ObjCType::UShort => "S".into(),
            ObjCType::ULong => "L".into(),
            ObjCType::ULongLong => "Q".into(),
            ObjCType::UInt128 => "T".into(),
            ObjCType::Float => "f".into(),
            ObjCType::Double => "d".into(),
            ObjCType::LongDouble => "D".into(),
            ObjCType::Bool => "B".into(),
            ObjCType::Void => "v".into(),
            ObjCType::CString => "*".into(),
            ObjCType::Class => "#".into(),
            ObjCType::Sel => ":".into(),
            ObjCType::Atom => "%".into(),
            ObjCType::Unknown => "?".into(),
            ObjCType::Id { class, protocols } => match class {
                None if protocols.is_empty() => "@".into(),
                _ => {
                    let mut out = String::from("@\"");
                    if let Some(class) = class {
                        out.push_str(class);
                    }
                    if !protocols.is_empty() {
                        out.push('<');
                        out.push_str(&protocols.join(","));
                        out.push('>');
                    }
                    out.push('"');
                    out
                }
            },
            ObjCType::Block { signature } => match signature {
                None => "@?".into(),
                Some(sig) => format!("@?<{}>", sig.encode()),
            },
            ObjCType::Pointer(inner) => format!("^{}", inner.encode()),
            ObjCType::Array { len, element } => format!("[{}{}]", len, element.encode()),
            ObjCType::Struct { name, members } => encode_record('{', '}', name, members),
            ObjCType::Union { name, members } => encode_record('(', ')', name, members),
            ObjCType::Bitfield(bits) => format!("b{bits}"),
            ObjCType::Modified { modifiers, ty } => {
                let mut out = String::new();
                for modifier in modifiers {
                    out.push(modifier.encode());
                }
                out.push_str(&ty.encode());
                out
            }
        }
    }
}

fn encode_record(open: char, close: char, name: &str, members: &Option<Vec<Member>>) -> String {
    let mut out = String::new();
    out.push(open);
    out.push_str(name);
    if let Some(members) = members {
        out.push('=');
        for member in members {
            if let Some(name) = &member.name {
                out.push('"');
                out.push_str(name);
                out.push('"');
            }
            out.push_str(&member.ty.encode());
        }
    }
    out.push(close);
    out
}

/// Tokenizer over the encoding bytes.
///
/// Two states, as the grammar demands: normal single-character tokens, and
/// an identifier run entered after `{` or `(` (struct/union names may
/// contain template punctuation that would otherwise tokenize).
struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(s: &'a str) -> Self {
        Lexer {
            bytes: s.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, what: &str) -> DumpError {
        DumpError::Inconsistent(format!(
            "type encoding: {what} at byte {} of {:?}",
            self.pos,
            String::from_utf8_lossy(self.bytes)
        ))
    }

    fn read_number(&mut self) -> Option<u64> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
    }

    /// Identifier state: runs of `[A-Za-z0-9_$:<>?]`, left on `=` or a
    /// closing bracket.
    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            let ok = byte.is_ascii_alphanumeric()
                || matches!(byte, b'_' | b'$' | b':' | b'<' | b'>' | b'?' | b'.');
            if !ok {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn read_quoted(&mut self) -> DumpResult<String> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b'"' {
                let s = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(self.error("unterminated quote"))
    }
}

pub struct EncodingParser<'a> {
    lex: Lexer<'a>,
}

impl<'a> EncodingParser<'a> {
    pub fn new(s: &'a str) -> Self {
        EncodingParser { lex: Lexer::new(s) }
    }

    pub fn finished(&self) -> bool {
        self.lex.peek().is_none()
    }

    pub fn parse_type(&mut self) -> DumpResult<ObjCType> {
        let mut modifiers = Vec::new();
        while let Some(byte) = self.lex.peek() {
            match Modifier::from_byte(byte) {
                Some(modifier) => {
                    self.lex.bump();
                    modifiers.push(modifier);
                }
                None => break,
            }
        }
        let ty = self.parse_bare_type()?;
        if modifiers.is_empty() {
            Ok(ty)
        } else {
            Ok(ObjCType::Modified {
                modifiers,
                ty: Box::new(ty),
            })
        }
    }

    fn parse_bare_type(&mut self) -> DumpResult<ObjCType> {
        let byte = self.lex.bump().ok_or_else(|| self.lex.error("empty type"))?;
        match byte {
            b'c' => Ok(ObjCType::Char),
            b'i' => Ok(ObjCType::Int),
            b's' => Ok(ObjCType::Short),
            b'l' => Ok(ObjCType::Long),
            b'q' => Ok(ObjCType::LongLong),
            b't' => Ok(ObjCType::Int128),
            b'C' => Ok(ObjCType::UChar),
            b'I' => Ok(ObjCType::UInt),
            b'S' => Ok(ObjCType::UShort),
            b'L' => Ok(ObjCType::ULong),
            b'Q' => Ok(ObjCType::ULongLong),
            b'T' => Ok(ObjCType::UInt128),
            b'f' => Ok(ObjCType::Float),
            b'd' => Ok(ObjCType::Double),
            b'D' => Ok(ObjCType::LongDouble),
            b'B' => Ok(ObjCType::Bool),
            b'v' => Ok(ObjCType::Void),
            b'*' => Ok(ObjCType::CString),
            b'#' => Ok(ObjCType::Class),
            b':' => Ok(ObjCType::Sel),
            b'%' => Ok(ObjCType::Atom),
            b'?' => Ok(ObjCType::Unknown),
            b'@' => self.parse_object(),
            b'^' => Ok(ObjCType::Pointer(Box::new(self.parse_type()?))),
            b'[' => self.parse_array(),
            b'{' => self.parse_record(b'}'),
            b'(' => self.parse_record(b')'),
            b'b' => {
                let bits = self
                    .lex
                    .read_number()
                    .ok_or_else(|| self.lex.error("bitfield without width"))?;
                Ok(ObjCType::Bitfield(bits as u32))
            }
            other => Err(self.lex.error(&format!("unexpected byte {:?}", other as char))),
        }
    }

    fn parse_object(&mut self) -> DumpResult<ObjCType> {
        if self.lex.eat(b'?') {
            // Block; the signature in angle brackets is optional.
            if self.lex.eat(b'<') {
                let mut items = Vec::new();
                while self.lex.peek() != Some(b'>') {
                    if self.lex.peek().is_none() {
                        return Err(self.lex.error("unterminated block signature"));
                    }
                    let ty = self.parse_type()?;
                    let offset = self.lex.read_number();
                    items.push(SignatureItem { ty, offset });
                }
                self.lex.bump();
                return Ok(ObjCType::Block {
                    signature: Some(MethodTypeList { items }),
                });
            }
            return Ok(ObjCType::Block { signature: None });
        }
        if self.lex.eat(b'"') {
            let raw = self.lex.read_quoted()?;
            let (class, protocols) = split_class_protocols(&raw);
            return Ok(ObjCType::Id { class, protocols });
        }
        Ok(ObjCType::Id {
            class: None,
            protocols: Vec::new(),
        })
    }

    fn parse_array(&mut self) -> DumpResult<ObjCType> {
        let len = self
            .lex
            .read_number()
            .ok_or_else(|| self.lex.error("array without length"))?;
        let element = self.parse_type()?;
        if !self.lex.eat(b']') {
            return Err(self.lex.error("unterminated array"));
        }
        Ok(ObjCType::Array {
            len,
            element: Box::new(element),
        })
    }

    fn parse_record(&mut self, close: u8) -> DumpResult<ObjCType> {
        let name = self.lex.read_identifier();
        let members = if self.lex.eat(b'=') {
            let mut members = Vec::new();
            while self.lex.peek() != Some(close) {
                if self.lex.peek().is_none() {
                    return Err(self.lex.error("unterminated record"));
                }
                let member_name = if self.lex.eat(b'"') {
                    Some(self.lex.read_quoted()?)
                } else {
                    None
                };
                let ty = self.parse_type()?;
                members.push(Member {
                    name: member_name,
                    ty,
                });
            }
            Some(members)
        } else {
            None
        };
        if !self.lex.eat(close) {
            return Err(self.lex.error("unterminated record"));
        }
        if close == b'}' {
            Ok(ObjCType::Struct { name, members })
        } else {
            Ok(ObjCType::Union { name, members })
        }
    }
}

fn split_class_protocols(raw: &str) -> (Option<String>, Vec<String>) {
    match raw.find('<') {
        Some(idx) => {
            let class = &raw[..idx];
            let rest = raw[idx + 1..].trim_end_matches('>');
            let protocols = rest
                .split(',')
                .filter(|p| !p.is_empty())
                .map(|p| p.to_string())
                .collect();
            let class = if class.is_empty() {
                None
            } else {
                Some(class.to_string())
            };
            (class, protocols)
        }
        None if raw.is_empty() => (None, Vec::new()),
        None => (Some(raw.to_string()), Vec::new()),
    }
}

/// Parse a single type encoding (as found on ivars and properties).
pub fn parse_encoding(s: &str) -> DumpResult<ObjCType> {
    let mut parser = EncodingParser::new(s);
    let ty = parser.parse_type()?;
    if !parser.finished() {
        return Err(DumpError::Inconsistent(format!(
            "trailing bytes in type encoding {s:?}"
        )));
    }
    Ok(ty)
}

/// Parse a method encoding: interleaved types and stack offsets.
pub fn parse_method_encoding(s: &str) -> DumpResult<MethodTypeList> {
    let mut parser = EncodingParser::new(s);
    let mut items = Vec::new();
    while !parser.finished() {
        let ty = parser.parse_type()?;
        let offset = parser.lex.read_number();
        items.push(SignatureItem { ty, offset });
    }
    if items.is_empty() {
        return Err(DumpError::Inconsistent("empty method encoding".into()));
    }
    Ok(MethodTypeList { items })
}

lazy_static! {
    static ref PARSE_CACHE: Mutex<LruMap<String, Arc<ObjCType>, ByLength>> =
        Mutex::new(LruMap::new(ByLength::new(65_536)));
}

/// Cached variant of [`parse_encoding`]: one canonical AST per encoding
/// string, shared across threads.
pub fn parse_encoding_cached(s: &str) -> DumpResult<Arc<ObjCType>> {
    if let Ok(mut cache) = PARSE_CACHE.lock() {
        if let Some(hit) = cache.get(s) {
            return Ok(hit.clone());
        }
    }
    let parsed = Arc::new(parse_encoding(s)?);
    if let Ok(mut cache) = PARSE_CACHE.lock() {
        cache.insert(s.to_string(), parsed.clone());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        for enc in [
            "c", "i", "s", "l", "q", "C", "I", "S", "L", "Q", "f", "d", "D", "B", "v", "*", "#",
            ":", "%", "?", "t", "T",
        ] {
            assert_eq!(parse_encoding(enc).unwrap().encode(), enc);
        }
    }

    #[test]
    fn compound_roundtrip() {
        for enc in [
            "@",
            "@\"NSString\"",
            "@\"NSArray<NSCopying,NSCoding>\"",
            "@\"<NSFastEnumeration>\"",
            "@?",
            "@?<v8@?0i4>",
            "^i",
            "^^{CGRect}",
            "[12^f]",
            "{CGPoint=\"x\"d\"y\"d}",
            "{CGRect={CGPoint=dd}{CGSize=dd}}",
            "{Opaque}",
            "{Empty=}",
            "(Variant=\"a\"i\"b\"f)",
            "b3",
            "rv",
            "r^{__CFString=}",
            "N@",
            "Vv",
        ] {
            let parsed = parse_encoding(enc).unwrap();
            assert_eq!(parsed.encode(), enc, "roundtrip of {enc}");
        }
    }

    #[test]
    fn forward_declaration_is_distinct_from_empty() {
        let fwd = parse_encoding("{CGRect}").unwrap();
        let empty = parse_encoding("{CGRect=}").unwrap();
        match (&fwd, &empty) {
            (
                ObjCType::Struct { members: None, .. },
                ObjCType::Struct {
                    members: Some(members),
                    ..
                },
            ) => assert!(members.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn method_encoding_splits_offsets() {
        let sig = parse_method_encoding("v24@0:8@\"NSString\"16").unwrap();
        assert_eq!(sig.items.len(), 3);
        assert_eq!(sig.items[0].ty, ObjCType::Void);
        assert_eq!(sig.items[0].offset, Some(24));
        assert_eq!(sig.items[1].offset, Some(0));
        assert_eq!(sig.items[2].offset, Some(16));
        assert_eq!(sig.encode(), "v24@0:8@\"NSString\"16");
    }

    #[test]
    fn anonymous_struct_name() {
        let parsed = parse_encoding("{?=ii}").unwrap();
        match &parsed {
            ObjCType::Struct { name, members } => {
                assert_eq!(name, "?");
                assert_eq!(members.as_ref().unwrap().len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(parsed.encode(), "{?=ii}");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_encoding("").is_err());
        assert!(parse_encoding("{CGPoint=dd").is_err());
        assert!(parse_encoding("[4").is_err());
        assert!(parse_encoding("iq").is_err());
        assert!(parse_encoding("&").is_err());
    }

    #[test]
    fn cache_shares_results() {
        let a = parse_encoding_cached("{CGSize=dd}").unwrap();
        let b = parse_encoding_cached("{CGSize=dd}").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn template_names_lex_in_identifier_state() {
        let enc = "{vector<int>=^i^i}";
        let parsed = parse_encoding(enc).unwrap();
        match &parsed {
            ObjCType::Struct { name, .. } => assert_eq!(name, "vector<int>"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(parsed.encode(), enc);
    }
}
