//! Derives `SSHEncode` and `SSHDecode` for `nullssh::sshwire`.
//!
//! Struct fields are written in declaration order. Enum variants are
//! selected by their SSH name.
//!
//! Container attributes, for enums:
//! - `#[sshwire(variant_prefix)]` writes the variant name before its contents,
//!   and decoding reads it back.
//! - `#[sshwire(no_variant_names)]` skips `SSHEncodeEnum`. Encode only.
//!
//! Field and variant attributes:
//! - `#[sshwire(variant_name = field)]` writes the variant name of enum
//!   `field` before the attributed field.
//! - `#[sshwire(variant = NAME)]` gives a variant's name, a literal or constant.
//! - `#[sshwire(unknown)]` catches any other name. It can't be encoded.

use std::collections::HashSet;

use proc_macro::Span;
use virtue::generate::FnSelfArg;
use virtue::parse::{Attribute, AttributeLocation, EnumBody, EnumVariant, StructBody};
use virtue::prelude::*;
use virtue::utils::{parse_tagged_attribute, ParsedAttribute};

#[proc_macro_derive(SSHEncode, attributes(sshwire))]
pub fn derive_encode(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    encode(input).unwrap_or_else(|e| e.into_token_stream())
}

#[proc_macro_derive(SSHDecode, attributes(sshwire))]
pub fn derive_decode(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    decode(input).unwrap_or_else(|e| e.into_token_stream())
}

fn encode(input: TokenStream) -> Result<TokenStream> {
    let (mut gen, atts, body) = Parse::new(input)?.into_generator();
    match body {
        Body::Struct(body) => encode_struct(&mut gen, &body)?,
        Body::Enum(body) => {
            let cont = ContainerAtts::parse(&atts)?;
            encode_enum(&mut gen, &cont, &body)?;
            if !cont.no_variant_names {
                encode_enum_names(&mut gen, &body)?;
            }
        }
    }
    gen.finish()
}

fn decode(input: TokenStream) -> Result<TokenStream> {
    let (mut gen, atts, body) = Parse::new(input)?.into_generator();
    match body {
        Body::Struct(body) => decode_struct(&mut gen, &body)?,
        Body::Enum(body) => {
            let cont = ContainerAtts::parse(&atts)?;
            if cont.no_variant_names {
                return Err(custom("SSHDecode can't be derived with no_variant_names", None));
            }
            if cont.variant_prefix {
                decode_enum_prefixed(&mut gen)?;
            }
            decode_enum_names(&mut gen, &body)?;
        }
    }
    gen.finish()
}

fn custom(error: &str, span: Option<Span>) -> Error {
    Error::Custom { error: error.into(), span }
}

#[derive(Default)]
struct ContainerAtts {
    variant_prefix: bool,
    no_variant_names: bool,
}

impl ContainerAtts {
    fn parse(atts: &[Attribute]) -> Result<Self> {
        let mut c = Self::default();
        for a in atts {
            let Some(parsed) = parse_tagged_attribute(&a.tokens, "sshwire")? else {
                continue;
            };
            for p in parsed {
                match p {
                    ParsedAttribute::Tag(t) if t.to_string() == "variant_prefix" => {
                        c.variant_prefix = true
                    }
                    ParsedAttribute::Tag(t) if t.to_string() == "no_variant_names" => {
                        c.no_variant_names = true
                    }
                    _ => return Err(custom("Unknown sshwire attribute", None)),
                }
            }
        }
        Ok(c)
    }
}

enum FieldAtt {
    VariantName(Ident),
    Variant(TokenTree),
    Unknown,
}

fn field_atts(atts: &[Attribute]) -> Result<Vec<FieldAtt>> {
    let mut r = vec![];
    for a in atts {
        if !matches!(a.location, AttributeLocation::Field | AttributeLocation::Variant) {
            continue;
        }
        let mut t = a.tokens.stream().into_iter();
        match t.next() {
            Some(TokenTree::Ident(i)) if i.to_string() == "sshwire" => (),
            // doc comments etc
            _ => continue,
        }
        let span = Some(a.tokens.span());
        let Some(TokenTree::Group(g)) = t.next() else {
            return Err(custom("#[sshwire] needs (...)", span));
        };
        let parts: Vec<TokenTree> = g.stream().into_iter().collect();
        let att = match parts.as_slice() {
            [TokenTree::Ident(k)] if k.to_string() == "unknown" => FieldAtt::Unknown,
            [TokenTree::Ident(k), TokenTree::Punct(p), TokenTree::Ident(v)]
                if k.to_string() == "variant_name" && p.as_char() == '=' =>
            {
                FieldAtt::VariantName(v.clone())
            }
            [TokenTree::Ident(k), TokenTree::Punct(p), v]
                if k.to_string() == "variant" && p.as_char() == '=' =>
            {
                FieldAtt::Variant(v.clone())
            }
            _ => return Err(custom("Unknown sshwire attribute", span)),
        };
        r.push(att);
    }
    Ok(r)
}

fn is_unknown(var: &EnumVariant) -> Result<bool> {
    Ok(field_atts(&var.attributes)?.iter().any(|a| matches!(a, FieldAtt::Unknown)))
}

/// The `#[sshwire(variant = ...)]` of a variant, as source text
fn variant_name(var: &EnumVariant) -> Result<String> {
    let mut names = field_atts(&var.attributes)?.into_iter().filter_map(|a| match a {
        FieldAtt::Variant(t) => Some(t.to_string()),
        _ => None,
    });
    match (names.next(), names.next()) {
        (Some(n), None) => Ok(n),
        _ => Err(custom(
            &format!("{} needs a single #[sshwire(variant = ...)]", var.name),
            None,
        )),
    }
}

/// Whether a variant is a unit or holds a single value
enum Shape {
    Unit,
    Single,
}

fn shape(var: &EnumVariant) -> Result<Shape> {
    match &var.fields {
        None => Ok(Shape::Unit),
        Some(Fields::Tuple(f)) if f.len() == 1 => Ok(Shape::Single),
        _ => Err(custom(
            &format!("{}: only unit or single value variants are supported", var.name),
            None,
        )),
    }
}

fn encode_struct(gen: &mut Generator, body: &StructBody) -> Result<()> {
    let mut code = String::new();
    match &body.fields {
        Some(Fields::Tuple(fields)) => {
            for (i, f) in fields.iter().enumerate() {
                if !f.attributes.is_empty() {
                    return Err(custom("No attributes for tuple structs", Some(f.span())));
                }
                code += &format!("crate::sshwire::SSHEncode::enc(&self.{i}, s)?;");
            }
        }
        Some(Fields::Struct(fields)) => {
            for (name, f) in fields {
                for a in field_atts(&f.attributes)? {
                    if let FieldAtt::VariantName(e) = a {
                        code += &format!(
                            "crate::sshwire::SSHEncode::enc(\
                            &crate::sshwire::SSHEncodeEnum::variant_name(&self.{e})?, s)?;"
                        );
                    }
                }
                code += &format!("crate::sshwire::SSHEncode::enc(&self.{name}, s)?;");
            }
        }
        None => (),
    }
    code += "let _ = s; Ok(())";

    gen.impl_for("crate::sshwire::SSHEncode")
        .generate_fn("enc")
        .with_generic_deps("S", ["crate::sshwire::SSHSink"])
        .with_self_arg(FnSelfArg::RefSelf)
        .with_arg("s", "&mut S")
        .with_return_type("crate::sshwire::WireResult<()>")
        .body(|b| {
            b.push_parsed(&code)?;
            Ok(())
        })?;
    Ok(())
}

fn encode_enum(gen: &mut Generator, cont: &ContainerAtts, body: &EnumBody) -> Result<()> {
    let mut code = String::from("let _ = &s;");
    if cont.variant_prefix {
        code += "crate::sshwire::SSHEncode::enc(\
            &crate::sshwire::SSHEncodeEnum::variant_name(self)?, s)?;";
    }
    code += "match *self {";
    for var in &body.variants {
        let arm = match (shape(var)?, is_unknown(var)?) {
            (Shape::Single, true) => {
                format!("Self::{}(_) => Err(crate::sshwire::WireError::UnknownVariant),", var.name)
            }
            (Shape::Single, false) => {
                format!("Self::{}(ref i) => crate::sshwire::SSHEncode::enc(i, s),", var.name)
            }
            (Shape::Unit, _) => format!("Self::{} => Ok(()),", var.name),
        };
        code += &arm;
    }
    code += "}";

    gen.impl_for("crate::sshwire::SSHEncode")
        .generate_fn("enc")
        .with_generic_deps("S", ["crate::sshwire::SSHSink"])
        .with_self_arg(FnSelfArg::RefSelf)
        .with_arg("s", "&mut S")
        .with_return_type("crate::sshwire::WireResult<()>")
        .body(|b| {
            b.push_parsed(&code)?;
            Ok(())
        })?;
    Ok(())
}

fn encode_enum_names(gen: &mut Generator, body: &EnumBody) -> Result<()> {
    let mut code = String::from("match self {");
    for var in &body.variants {
        let pat = match shape(var)? {
            Shape::Unit => format!("Self::{}", var.name),
            Shape::Single => format!("Self::{}(_)", var.name),
        };
        if is_unknown(var)? {
            code += &format!("{pat} => Err(crate::sshwire::WireError::UnknownVariant),");
        } else {
            code += &format!("{pat} => Ok({}),", variant_name(var)?);
        }
    }
    code += "}";

    gen.impl_for("crate::sshwire::SSHEncodeEnum")
        .generate_fn("variant_name")
        .with_self_arg(FnSelfArg::RefSelf)
        .with_return_type("crate::sshwire::WireResult<&'static str>")
        .body(|b| {
            b.push_parsed(&code)?;
            Ok(())
        })?;
    Ok(())
}

fn decode_struct(gen: &mut Generator, body: &StructBody) -> Result<()> {
    let mut code = String::new();
    let build = match &body.fields {
        Some(Fields::Tuple(fields)) => {
            let args = "crate::sshwire::SSHDecode::dec(s)?,".repeat(fields.len());
            format!("Self({args})")
        }
        Some(Fields::Struct(fields)) => {
            let mut named = HashSet::new();
            let mut inits = String::new();
            for (name, f) in fields {
                for a in field_atts(&f.attributes)? {
                    if let FieldAtt::VariantName(e) = a {
                        // the name is on the wire but not a struct field
                        code += &format!(
                            "let name_{e}: crate::sshwire::BinString = \
                            crate::sshwire::SSHDecode::dec(s)?;"
                        );
                        named.insert(e.to_string());
                    }
                }
                let n = name.to_string();
                if named.contains(&n) {
                    code += &format!(
                        "let f_{n} = crate::sshwire::SSHDecodeEnum::dec_enum(s, name_{n}.0)?;"
                    );
                } else {
                    code += &format!("let f_{n} = crate::sshwire::SSHDecode::dec(s)?;");
                }
                inits += &format!("{n}: f_{n},");
            }
            format!("Self {{ {inits} }}")
        }
        None => "Self {}".into(),
    };
    code += &format!("let _ = s; Ok({build})");
    decode_impl(gen, "crate::sshwire::SSHDecode", "dec", false, code)
}

fn decode_enum_prefixed(gen: &mut Generator) -> Result<()> {
    let code = "let variant: crate::sshwire::BinString = crate::sshwire::SSHDecode::dec(s)?; \
        crate::sshwire::SSHDecodeEnum::dec_enum(s, variant.0)";
    decode_impl(gen, "crate::sshwire::SSHDecode", "dec", false, code.into())
}

fn decode_enum_names(gen: &mut Generator, body: &EnumBody) -> Result<()> {
    let mut code = String::from(
        "let _ = &s; match crate::sshwire::try_as_ascii_str(variant).ok() {",
    );
    let mut unknown = None;
    for var in &body.variants {
        let sh = shape(var)?;
        if is_unknown(var)? {
            if !matches!(sh, Shape::Single) {
                return Err(custom("#[sshwire(unknown)] needs a single value", None));
            }
            let arm = format!(
                "_ => {{ s.ctx().seen_unknown = true; \
                Ok(Self::{}(crate::packets::Unknown(variant))) }}",
                var.name
            );
            if unknown.replace(arm).is_some() {
                return Err(custom("Only one variant can be #[sshwire(unknown)]", None));
            }
            continue;
        }
        let value = match sh {
            Shape::Unit => format!("Self::{}", var.name),
            Shape::Single => format!("Self::{}(crate::sshwire::SSHDecode::dec(s)?)", var.name),
        };
        code += &format!("Some({}) => Ok({value}),", variant_name(var)?);
    }
    // the catch-all goes last
    code += &unknown.unwrap_or_else(|| "_ => Err(crate::sshwire::WireError::SSHProtoError),".into());
    code += "}";
    decode_impl(gen, "crate::sshwire::SSHDecodeEnum", "dec_enum", true, code)
}

/// Implements a decode trait with a `'de` lifetime outliving the type's own
fn decode_impl(
    gen: &mut Generator,
    tr: &str,
    func: &str,
    with_variant: bool,
    code: String,
) -> Result<()> {
    let mut imp = gen.impl_for_with_lifetimes(tr, ["de"]);
    let mut f = imp
        .modify_generic_constraints(|generics, where_constraints| {
            for lt in generics.iter_lifetimes() {
                where_constraints.push_parsed_constraint(format!("'de: '{}", lt.ident))?;
            }
            Ok(())
        })?
        .generate_fn(func)
        .with_generic_deps("S", ["crate::sshwire::SSHSource<'de>"])
        .with_arg("s", "&mut S");
    if with_variant {
        f = f.with_arg("variant", "&'de [u8]");
    }
    f.with_return_type("crate::sshwire::WireResult<Self>").body(|b| {
        b.push_parsed(&code)?;
        Ok(())
    })?;
    Ok(())
}
