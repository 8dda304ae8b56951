use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::encoding::{Member, MethodTypeList, ObjCType};

/// The most complete definition seen for each struct/union name.
///
/// Encodings scatter the same record across many declarations, most of them
/// forward-declared (`{CGRect}`) or partially named. Registration keeps the
/// definition with the most named members; resolution substitutes it back
/// into forward declarations, cycle-safe.
#[derive(Debug, Default)]
pub struct StructureRegistry {
    records: Mutex<HashMap<String, Vec<Member>>>,
}

fn named_member_count(members: &[Member]) -> usize {
    members.iter().filter(|m| m.name.is_some()).count()
}

impl StructureRegistry {
    pub fn new() -> Self {
        StructureRegistry::default()
    }

    /// Walk `ty` and take every struct/union definition it contains.
    pub fn register(&self, ty: &ObjCType) {
        match ty {
            ObjCType::Struct { name, members } | ObjCType::Union { name, members } => {
                if let Some(members) = members {
                    if !members.is_empty() && name != "?" {
                        self.offer(name, members);
                    }
                    for member in members {
                        self.register(&member.ty);
                    }
                }
            }
            ObjCType::Pointer(inner) => self.register(inner),
            ObjCType::Array { element, .. } => self.register(element),
            ObjCType::Modified { ty, .. } => self.register(ty),
            ObjCType::Block {
                signature: Some(sig),
            } => {
                for item in &sig.items {
                    self.register(&item.ty);
                }
            }
            _ => {}
        }
    }

    /// An incoming record replaces the stored one iff it has more named
    /// members.
    fn offer(&self, name: &str, members: &[Member]) {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        match records.get(name) {
            Some(existing) if named_member_count(existing) >= named_member_count(members) => {}
            _ => {
                records.insert(name.to_string(), members.to_vec());
            }
        }
    }

    pub fn definition(&self, name: &str) -> Option<Vec<Member>> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(name).cloned())
    }

    pub fn names(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Substitute stored definitions into the forward declarations of `ty`.
    pub fn resolve(&self, ty: &ObjCType) -> ObjCType {
        let mut visited = HashSet::new();
        self.resolve_inner(ty, &mut visited)
    }

    fn resolve_inner(&self, ty: &ObjCType, visited: &mut HashSet<String>) -> ObjCType {
        match ty {
            ObjCType::Struct { name, members } => {
                let members = self.resolve_members(name, members, visited);
                ObjCType::Struct {
                    name: name.clone(),
                    members,
                }
            }
            ObjCType::Union { name, members } => {
                let members = self.resolve_members(name, members, visited);
                ObjCType::Union {
                    name: name.clone(),
                    members,
                }
            }
            ObjCType::Pointer(inner) => {
                ObjCType::Pointer(Box::new(self.resolve_inner(inner, visited)))
            }
            ObjCType::Array { len, element } => ObjCType::Array {
                len: *len,
                element: Box::new(self.resolve_inner(element, visited)),
            },
            ObjCType::Modified { modifiers, ty } => ObjCType::Modified {
                modifiers: modifiers.clone(),
                ty: Box::new(self.resolve_inner(ty, visited)),
            },
            other => other.clone(),
        }
    }

    fn resolve_members(
        &self,
        name: &str,
        members: &Option<Vec<Member>>,
        visited: &mut HashSet<String>,
    ) -> Option<Vec<Member>> {
        // Visit each record name once; self-referential structs otherwise
        // recurse forever through their own pointers.
        let fresh = !name.is_empty() && name != "?" && visited.insert(name.to_string());
        let source = match members {
            Some(existing) if !existing.is_empty() => Some(existing.clone()),
            _ if fresh => self.definition(name).or_else(|| members.clone()),
            _ => members.clone(),
        };
        source.map(|members| {
            members
                .iter()
                .map(|member| Member {
                    name: member.name.clone(),
                    ty: if fresh {
                        self.resolve_inner(&member.ty, visited)
                    } else {
                        member.ty.clone()
                    },
                })
                .collect()
        })
    }
}

/// Standard platform typedefs and their underlying encodings; `BOOL` is
/// `signed char` on the 64-bit ObjC ABIs this crate targets.
pub const STANDARD_TYPEDEFS: &[(&str, &str)] = &[
    ("CGFloat", "d"),
    ("NSInteger", "q"),
    ("NSUInteger", "Q"),
    ("CFIndex", "q"),
    ("CFTimeInterval", "d"),
    ("NSTimeInterval", "d"),
    ("OSStatus", "i"),
    ("Boolean", "C"),
    ("BOOL", "c"),
];

impl StructureRegistry {
    /// The underlying type of a pre-populated standard typedef.
    pub fn typedef(&self, name: &str) -> Option<ObjCType> {
        STANDARD_TYPEDEFS
            .iter()
            .find(|(typedef, _)| *typedef == name)
            .and_then(|(_, encoding)| crate::encoding::parse_encoding(encoding).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureSource {
    Protocol(String),
    Class(String),
}

#[derive(Debug, Clone)]
pub struct SignatureEntry {
    pub source: SignatureSource,
    pub encoding: String,
}

/// Selector to known type encodings, protocol declarations preferred.
///
/// Class method lists only carry the compressed `@?` for block arguments;
/// protocol declarations keep the full `@?<...>` signature. Looking the
/// selector up here lets the formatter print the richer form.
#[derive(Debug, Default)]
pub struct MethodSignatureRegistry {
    entries: Mutex<HashMap<String, Vec<SignatureEntry>>>,
}

impl MethodSignatureRegistry {
    pub fn new() -> Self {
        MethodSignatureRegistry::default()
    }

    pub fn register(&self, selector: &str, encoding: &str, source: SignatureSource) {
        if encoding.is_empty() {
            return;
        }
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = entries.entry(selector.to_string()).or_default();
        if bucket.iter().any(|e| e.encoding == encoding) {
            return;
        }
        bucket.push(SignatureEntry {
            source,
            encoding: encoding.to_string(),
        });
    }

    /// Best known encoding for `selector`, protocol entries first.
    pub fn lookup(&self, selector: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        let bucket = entries.get(selector)?;
        bucket
            .iter()
            .find(|e| matches!(e.source, SignatureSource::Protocol(_)))
            .or_else(|| bucket.first())
            .map(|e| e.encoding.clone())
    }

    /// A protocol-sourced signature whose parse succeeds and carries a full
    /// block signature, if any.
    pub fn richer_block_signature(&self, selector: &str) -> Option<MethodTypeList> {
        let entries = self.entries.lock().ok()?;
        let bucket = entries.get(selector)?;
        bucket
            .iter()
            .filter(|e| matches!(e.source, SignatureSource::Protocol(_)))
            .filter_map(|e| crate::encoding::parse_method_encoding(&e.encoding).ok())
            .find(|sig| {
                sig.items.iter().any(|item| {
                    matches!(
                        &item.ty,
                        ObjCType::Block {
                            signature: Some(_)
                        }
                    )
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::parse_encoding;

    #[test]
    fn forward_declared_struct_resolves() {
        let registry = StructureRegistry::new();
        registry.register(&parse_encoding("{CGPoint=\"x\"d\"y\"d}").unwrap());
        registry.register(&parse_encoding("{CGSize=\"width\"d\"height\"d}").unwrap());
        registry.register(
            &parse_encoding("{CGRect=\"origin\"{CGPoint=\"x\"d\"y\"d}\"size\"{CGSize=\"width\"d\"height\"d}}")
                .unwrap(),
        );

        let resolved = registry.resolve(&parse_encoding("{CGPoint}").unwrap());
        assert_eq!(
            resolved.encode(),
            "{CGPoint=\"x\"d\"y\"d}"
        );

        // Unknown structs come back unchanged.
        let unknown = parse_encoding("{Mystery}").unwrap();
        assert_eq!(registry.resolve(&unknown), unknown);
    }

    #[test]
    fn replacement_keeps_most_named_members() {
        let registry = StructureRegistry::new();
        registry.register(&parse_encoding("{CGPoint=dd}").unwrap());
        registry.register(&parse_encoding("{CGPoint=\"x\"d\"y\"d}").unwrap());
        // A later, less complete registration must not clobber it.
        registry.register(&parse_encoding("{CGPoint=dd}").unwrap());

        let stored = registry.definition("CGPoint").unwrap();
        assert_eq!(named_member_count(&stored), 2);
    }

    #[test]
    fn nested_definitions_are_collected() {
        let registry = StructureRegistry::new();
        registry.register(
            &parse_encoding("{Outer=\"inner\"{Inner=\"value\"i}}").unwrap(),
        );
        assert!(registry.definition("Inner").is_some());
        assert!(registry.definition("Outer").is_some());
    }

    #[test]
    fn cyclic_structs_terminate() {
        let registry = StructureRegistry::new();
        // A node whose member points back at its own type.
        registry.register(&parse_encoding("{Node=\"next\"^{Node}}").unwrap());
        let resolved = registry.resolve(&parse_encoding("{Node}").unwrap());
        match resolved {
            ObjCType::Struct { name, members } => {
                assert_eq!(name, "Node");
                assert!(members.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn standard_typedefs_resolve() {
        let registry = StructureRegistry::new();
        assert_eq!(registry.typedef("CGFloat"), Some(ObjCType::Double));
        assert_eq!(registry.typedef("NSInteger"), Some(ObjCType::LongLong));
        assert_eq!(registry.typedef("BOOL"), Some(ObjCType::Char));
        assert_eq!(registry.typedef("NotATypedef"), None);
    }

    #[test]
    fn protocol_signatures_win() {
        let registry = MethodSignatureRegistry::new();
        registry.register(
            "completion:",
            "v24@0:8@?16",
            SignatureSource::Class("Downloader".into()),
        );
        registry.register(
            "completion:",
            "v24@0:8@?<v16@?0@\"NSData\"8>16",
            SignatureSource::Protocol("DownloadDelegate".into()),
        );
        assert_eq!(
            registry.lookup("completion:").unwrap(),
            "v24@0:8@?<v16@?0@\"NSData\"8>16"
        );
        assert!(registry.richer_block_signature("completion:").is_some());
        assert!(registry.richer_block_signature("missing:").is_none());
    }
}
