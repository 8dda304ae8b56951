use crate::encoding::{
    parse_encoding_cached, parse_method_encoding, Member, MethodTypeList, Modifier, ObjCType,
    SignatureItem,
};
use crate::objc::{ObjCIvar, ObjCMethod, ObjCProperty};
use crate::registry::{MethodSignatureRegistry, StructureRegistry};

/// Render `ty` as a C declaration for `var`; pass an empty `var` for a
/// bare type (casts, return types).
pub fn format_type(ty: &ObjCType, var: &str) -> String {
    declarator(ty, var.to_string()).trim_end().to_string()
}

fn join(base: &str, inner: &str) -> String {
    if inner.is_empty() {
        base.to_string()
    } else {
        format!("{base} {inner}")
    }
}

fn declarator(ty: &ObjCType, inner: String) -> String {
    match ty {
        ObjCType::Pointer(pointee) => match pointee.as_ref() {
            ObjCType::Array { .. } => declarator(pointee, format!("(*{inner})")),
            _ => declarator(pointee, format!("*{inner}")),
        },
        ObjCType::Array { len, element } => declarator(element, format!("{inner}[{len}]")),
        ObjCType::Modified { modifiers, ty } => {
            let keywords: Vec<&str> = modifiers.iter().map(Modifier::keyword).collect();
            format!("{} {}", keywords.join(" "), declarator(ty, inner))
        }
        ObjCType::Block {
            signature: Some(sig),
        } => format_block(sig, &inner),
        ObjCType::Bitfield(bits) => {
            if inner.is_empty() {
                format!("unsigned int :{bits}")
            } else {
                format!("unsigned int {inner}:{bits}")
            }
        }
        ObjCType::CString => {
            if inner.is_empty() {
                "char *".to_string()
            } else {
                format!("char *{inner}")
            }
        }
        ObjCType::Id { class, protocols } => {
            let protos = if protocols.is_empty() {
                String::new()
            } else {
                format!("<{}>", protocols.join(", "))
            };
            match class {
                Some(class) => join(&format!("{class}{protos} *"), &inner)
                    .replace("* ", "*")
                    .trim_end()
                    .to_string(),
                None => join(&format!("id{protos}"), &inner),
            }
        }
        other => join(&base_name(other), &inner),
    }
}

fn base_name(ty: &ObjCType) -> String {
    match ty {
        ObjCType::Char => "char".into(),
        ObjCType::Int => "int".into(),
        ObjCType::Short => "short".into(),
        ObjCType::Long => "long".into(),
        ObjCType::LongLong => "long long".into(),
        ObjCType::Int128 => "__int128".into(),
        ObjCType::UChar => "unsigned char".into(),
        ObjCType::UInt => "unsigned int".into(),
        ObjCType::UShort => "unsigned short".into(),
        ObjCType::ULong => "unsigned long".into(),
        ObjCType::ULongLong => "unsigned long long".into(),
        ObjCType::UInt128 => "unsigned __int128".into(),
        ObjCType::Float => "float".into(),
        ObjCType::Double => "double".into(),
        ObjCType::LongDouble => "long double".into(),
        ObjCType::Bool => "_Bool".into(),
        ObjCType::Void => "void".into(),
        ObjCType::CString => "char *".into(),
        ObjCType::Class => "Class".into(),
        ObjCType::Sel => "SEL".into(),
        ObjCType::Atom => "atom".into(),
        ObjCType::Unknown => "void".into(),
        ObjCType::Block { signature: None } => "id /* block */".into(),
        ObjCType::Struct { name, members } => record_name("struct", name, members),
        ObjCType::Union { name, members } => record_name("union", name, members),
        // Compound forms never reach here; declarator handles them.
        other => format_type(other, ""),
    }
}

fn record_name(keyword: &str, name: &str, members: &Option<Vec<Member>>) -> String {
    if name == "?" {
        match members {
            Some(members) => {
                let body: Vec<String> = members
                    .iter()
                    .enumerate()
                    .map(|(i, member)| {
                        let field = member
                            .name
                            .clone()
                            .unwrap_or_else(|| format!("field{i}"));
                        format!("{};", declarator(&member.ty, field))
                    })
                    .collect();
                format!("{keyword} {{ {} }}", body.join(" "))
            }
            None => format!("{keyword} {{ }}"),
        }
    } else {
        format!("{keyword} {name}")
    }
}

fn format_block(sig: &MethodTypeList, inner: &str) -> String {
    let ret = sig
        .items
        .first()
        .map(|item| format_type(&item.ty, ""))
        .unwrap_or_else(|| "void".to_string());
    // Item 1 is the block object itself; real parameters follow.
    let params: Vec<String> = sig
        .items
        .iter()
        .skip(2)
        .map(|item| format_type(&item.ty, ""))
        .collect();
    let params = if params.is_empty() {
        "void".to_string()
    } else {
        params.join(", ")
    };
    format!("{ret} (^{inner})({params})")
}

/// `- (void)setName:(NSString *)arg1;` and friends.
pub fn format_method(
    method: &ObjCMethod,
    is_class_method: bool,
    signatures: Option<&MethodSignatureRegistry>,
) -> String {
    let prefix = if is_class_method { "+" } else { "-" };
    let selector = method.selector.as_ref();

    let mut parsed = match parse_method_encoding(&method.type_encoding) {
        Ok(parsed) => parsed,
        Err(_) => {
            return format!("{prefix} {selector}; // {}", method.type_encoding);
        }
    };

    // Swap in a protocol's richer signature when the class encoding only
    // says `@?` for a block argument.
    if let Some(registry) = signatures {
        let has_bare_block = parsed
            .items
            .iter()
            .any(|item| matches!(item.ty, ObjCType::Block { signature: None }));
        if has_bare_block {
            if let Some(richer) = registry.richer_block_signature(selector) {
                if richer.items.len() == parsed.items.len() {
                    parsed = richer;
                }
            }
        }
    }

    let ret = parsed
        .return_type()
        .map(|ty| format_type(ty, ""))
        .unwrap_or_else(|| "void".to_string());

    if !selector.contains(':') {
        return format!("{prefix} ({ret}){selector};");
    }

    let parts: Vec<&str> = selector.split_inclusive(':').collect();
    let args = parsed.method_args();
    let mut out = format!("{prefix} ({ret})");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(part);
        let arg_type = args
            .get(i)
            .map(|item: &SignatureItem| format_type(&item.ty, ""))
            .unwrap_or_else(|| "id".to_string());
        out.push_str(&format!("({arg_type})arg{}", i + 1));
    }
    out.push(';');
    out
}

/// `@property (nonatomic, copy) NSString *name;`
pub fn format_property(property: &ObjCProperty) -> String {
    let attrs = &property.parsed;
    let mut flags: Vec<String> = Vec::new();
    if attrs.readonly {
        flags.push("readonly".into());
    }
    if attrs.copy {
        flags.push("copy".into());
    }
    if attrs.retain {
        flags.push("retain".into());
    }
    if attrs.weak {
        flags.push("weak".into());
    }
    if attrs.nonatomic {
        flags.push("nonatomic".into());
    }
    if let Some(getter) = &attrs.custom_getter {
        flags.push(format!("getter={getter}"));
    }
    if let Some(setter) = &attrs.custom_setter {
        flags.push(format!("setter={setter}"));
    }

    let decl = match parse_encoding_cached(&attrs.encoded_type) {
        Ok(ty) => declarator(ty.as_ref(), property.name.to_string()),
        Err(_) => format!("id {}", property.name),
    };

    if flags.is_empty() {
        format!("@property {decl};")
    } else {
        format!("@property ({}) {decl};", flags.join(", "))
    }
}

/// One ivar declaration, with forward-declared record types resolved when
/// a registry is supplied.
pub fn format_ivar(ivar: &ObjCIvar, structs: Option<&StructureRegistry>) -> String {
    let decl = match parse_encoding_cached(&ivar.type_encoding) {
        Ok(ty) => {
            let resolved = match structs {
                Some(registry) => registry.resolve(&ty),
                None => (*ty).clone(),
            };
            declarator(&resolved, ivar.name.to_string())
        }
        Err(_) => format!("id {}", ivar.name),
    };
    format!("{decl};")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::parse_encoding;
    use crate::objc::PropertyAttributes;
    use crate::registry::SignatureSource;
    use std::sync::Arc;

    fn fmt(encoding: &str, var: &str) -> String {
        format_type(&parse_encoding(encoding).unwrap(), var)
    }

    #[test]
    fn scalar_declarations() {
        assert_eq!(fmt("i", "count"), "int count");
        assert_eq!(fmt("Q", "mask"), "unsigned long long mask");
        assert_eq!(fmt("v", ""), "void");
        assert_eq!(fmt("*", "label"), "char *label");
        assert_eq!(fmt("B", "flag"), "_Bool flag");
    }

    #[test]
    fn object_declarations() {
        assert_eq!(fmt("@", "obj"), "id obj");
        assert_eq!(fmt("@\"NSString\"", "name"), "NSString *name");
        assert_eq!(
            fmt("@\"NSArray<NSCopying>\"", "items"),
            "NSArray<NSCopying> *items"
        );
        assert_eq!(fmt("@\"<NSCoding>\"", "target"), "id<NSCoding> target");
        assert_eq!(fmt("#", "cls"), "Class cls");
        assert_eq!(fmt(":", "action"), "SEL action");
    }

    #[test]
    fn pointer_and_array_declarators() {
        assert_eq!(fmt("^i", "p"), "int *p");
        assert_eq!(fmt("^^c", "pp"), "char **pp");
        assert_eq!(fmt("[4i]", "quad"), "int quad[4]");
        assert_eq!(fmt("[2[3f]]", "grid"), "float grid[2][3]");
        assert_eq!(fmt("^[4i]", "pa"), "int (*pa)[4]");
        assert_eq!(fmt("r^{__CFString=}", "ref"), "const struct __CFString *ref");
    }

    #[test]
    fn struct_declarations() {
        assert_eq!(fmt("{CGRect}", "frame"), "struct CGRect frame");
        assert_eq!(fmt("{?=\"x\"i\"y\"i}", "pair"), "struct { int x; int y; } pair");
        assert_eq!(fmt("b3", "bits"), "unsigned int bits:3");
    }

    #[test]
    fn block_declarations() {
        assert_eq!(
            fmt("@?<v16@?0@\"NSData\"8>", "handler"),
            "void (^handler)(NSData *)"
        );
        assert_eq!(fmt("@?", "callback"), "id /* block */ callback");
    }

    #[test]
    fn plain_method_formatting() {
        let method = ObjCMethod {
            selector: Arc::from("count"),
            type_encoding: Arc::from("Q16@0:8"),
            imp: 0x1000,
        };
        assert_eq!(
            format_method(&method, false, None),
            "- (unsigned long long)count;"
        );
    }

    #[test]
    fn multi_argument_method_formatting() {
        let method = ObjCMethod {
            selector: Arc::from("setObject:forKey:"),
            type_encoding: Arc::from("v32@0:8@16@\"NSString\"24"),
            imp: 0,
        };
        assert_eq!(
            format_method(&method, false, None),
            "- (void)setObject:(id)arg1 forKey:(NSString *)arg2;"
        );
    }

    #[test]
    fn class_method_prefix() {
        let method = ObjCMethod {
            selector: Arc::from("sharedInstance"),
            type_encoding: Arc::from("@16@0:8"),
            imp: 0,
        };
        assert_eq!(format_method(&method, true, None), "+ (id)sharedInstance;");
    }

    #[test]
    fn registry_upgrades_bare_blocks() {
        let registry = MethodSignatureRegistry::new();
        registry.register(
            "fetch:",
            "v24@0:8@?<v16@?0@\"NSData\"8>16",
            SignatureSource::Protocol("Fetching".into()),
        );
        let method = ObjCMethod {
            selector: Arc::from("fetch:"),
            type_encoding: Arc::from("v24@0:8@?16"),
            imp: 0,
        };
        assert_eq!(
            format_method(&method, false, Some(&registry)),
            "- (void)fetch:(void (^)(NSData *))arg1;"
        );
        assert_eq!(
            format_method(&method, false, None),
            "- (void)fetch:(id /* block */)arg1;"
        );
    }

    #[test]
    fn property_formatting() {
        let raw = "T@\"NSString\",C,N,V_name";
        let property = ObjCProperty {
            name: Arc::from("name"),
            raw_attributes: Arc::from(raw),
            parsed: PropertyAttributes::parse(raw),
        };
        assert_eq!(
            format_property(&property),
            "@property (copy, nonatomic) NSString *name;"
        );
    }

    #[test]
    fn property_with_custom_accessors() {
        let raw = "Tc,R,GisEnabled,N";
        let property = ObjCProperty {
            name: Arc::from("enabled"),
            raw_attributes: Arc::from(raw),
            parsed: PropertyAttributes::parse(raw),
        };
        assert_eq!(
            format_property(&property),
            "@property (readonly, nonatomic, getter=isEnabled) char enabled;"
        );
    }

    #[test]
    fn ivar_formatting_resolves_structs() {
        let registry = StructureRegistry::new();
        registry.register(&parse_encoding("{CGPoint=\"x\"d\"y\"d}").unwrap());
        let ivar = ObjCIvar {
            name: Arc::from("_origin"),
            type_encoding: Arc::from("{CGPoint}"),
            offset: 8,
            size: 16,
            alignment: 8,
        };
        assert_eq!(format_ivar(&ivar, Some(&registry)), "struct CGPoint _origin;");

        let plain = ObjCIvar {
            name: Arc::from("_count"),
            type_encoding: Arc::from("Q"),
            offset: 24,
            size: 8,
            alignment: 8,
        };
        assert_eq!(format_ivar(&plain, None), "unsigned long long _count;");
    }
}
