//! Implementation of the Record derive macro.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{
    Data, DeriveInput, Error, Field, Fields, GenericArgument, Ident, LitStr, PathArguments,
    Result, Type, Visibility,
};

/// Parsed struct with `#[derive(Record)]`.
#[derive(Debug)]
pub struct RecordDef {
    pub name: Ident,
    pub fields: Vec<RecordFieldDef>,
}

/// How an embedded record is held by its parent field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Direct,
    Boxed,
    Optional,
    OptionalBoxed,
}

#[derive(Debug)]
pub enum FieldMode {
    Column,
    Embed { inner: Type, holder: Holder },
}

#[derive(Debug)]
pub struct RecordFieldDef {
    pub ident: Ident,
    /// Field name without any raw-identifier prefix.
    pub name: String,
    pub ty: Type,
    pub tags: Option<String>,
    pub mode: FieldMode,
}

pub fn parse_record(input: &DeriveInput) -> Result<RecordDef> {
    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "Record cannot be derived for generic structs",
        ));
    }

    let fields = match &input.data {
        Data::Struct(data) => parse_fields(&data.fields)?,
        Data::Enum(_) => {
            return Err(Error::new_spanned(
                input,
                "Record can only be derived for structs, not enums",
            ));
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Record can only be derived for structs, not unions",
            ));
        }
    };

    Ok(RecordDef {
        name: input.ident.clone(),
        fields,
    })
}

fn parse_fields(fields: &Fields) -> Result<Vec<RecordFieldDef>> {
    match fields {
        Fields::Named(named) => {
            let mut parsed = Vec::new();
            for field in &named.named {
                if let Some(def) = parse_field(field)? {
                    parsed.push(def);
                }
            }
            Ok(parsed)
        }
        Fields::Unnamed(_) => Err(Error::new_spanned(
            fields,
            "Record requires a struct with named fields",
        )),
        Fields::Unit => Ok(Vec::new()),
    }
}

/// Parse one field. Returns `None` for fields that are not mapped.
fn parse_field(field: &Field) -> Result<Option<RecordFieldDef>> {
    let ident = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected named field"))?;

    let mut tags = None;
    let mut skip = false;
    let mut embed = false;
    let mut annotated = false;

    for attr in &field.attrs {
        if !attr.path().is_ident("rowmap") {
            continue;
        }
        annotated = true;

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("tags") {
                let lit: LitStr = meta.value()?.parse()?;
                validate_tags(&lit)?;
                tags = Some(lit.value());
            } else if meta.path.is_ident("skip") {
                skip = true;
            } else if meta.path.is_ident("embed") {
                embed = true;
            } else {
                return Err(meta.error("unknown rowmap attribute, expected `tags`, `skip` or `embed`"));
            }
            Ok(())
        })?;
    }

    if skip || tags.as_deref() == Some("-") {
        return Ok(None);
    }

    if matches!(field.vis, Visibility::Inherited) {
        if annotated {
            return Err(Error::new_spanned(
                &ident,
                "only `pub` fields can be mapped; make the field public or mark it #[rowmap(skip)]",
            ));
        }
        return Ok(None);
    }

    let mode = if embed {
        let (inner, holder) = embedded_shape(&field.ty);
        FieldMode::Embed { inner, holder }
    } else {
        FieldMode::Column
    };

    Ok(Some(RecordFieldDef {
        name: ident.unraw().to_string(),
        ident,
        ty: field.ty.clone(),
        tags,
        mode,
    }))
}

/// Reject tag strings that can never parse, so the mistake shows up at the
/// field instead of at table construction.
fn validate_tags(lit: &LitStr) -> Result<()> {
    let value = lit.value();
    if value.trim() == "-" {
        return Ok(());
    }
    let piece = regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(=.*)?$")
        .map_err(|e| Error::new_spanned(lit, format!("internal tag pattern error: {e}")))?;
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if !piece.is_match(part) {
            return Err(Error::new_spanned(lit, format!("malformed tag '{part}'")));
        }
    }
    Ok(())
}

fn single_generic<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}

fn embedded_shape(ty: &Type) -> (Type, Holder) {
    if let Some(inner) = single_generic(ty, "Option") {
        return match single_generic(inner, "Box") {
            Some(boxed) => (boxed.clone(), Holder::OptionalBoxed),
            None => (inner.clone(), Holder::Optional),
        };
    }
    match single_generic(ty, "Box") {
        Some(boxed) => (boxed.clone(), Holder::Boxed),
        None => (ty.clone(), Holder::Direct),
    }
}

pub fn generate_record_impl(def: &RecordDef) -> TokenStream {
    let record = &def.name;
    let mut accessors = Vec::new();
    let mut entries = Vec::new();

    for field in &def.fields {
        let ident = &field.ident;
        let name = &field.name;
        let get_fn = format_ident!("__rowmap_ref_{}", ident);
        let mut_fn = format_ident!("__rowmap_mut_{}", ident);
        let tags = field.tags.as_deref().map(|t| quote! { .tags(#t) });

        match &field.mode {
            FieldMode::Column => {
                let ty = &field.ty;
                accessors.push(quote! {
                    fn #get_fn(r: &#record) -> &#ty { &r.#ident }
                    fn #mut_fn(r: &mut #record) -> &mut #ty { &mut r.#ident }
                });
                entries.push(quote! {
                    ::rowmap::FieldDef::<Self>::field::<#ty>(#name, #get_fn, #mut_fn) #tags
                });
            }
            FieldMode::Embed { inner, holder } => {
                let (project, project_mut) = match holder {
                    Holder::Direct => (
                        quote! { ::core::option::Option::Some(&r.#ident) },
                        quote! { ::core::option::Option::Some(&mut r.#ident) },
                    ),
                    Holder::Boxed => (
                        quote! { ::core::option::Option::Some(&*r.#ident) },
                        quote! { ::core::option::Option::Some(&mut *r.#ident) },
                    ),
                    Holder::Optional => (
                        quote! { r.#ident.as_ref() },
                        quote! { r.#ident.as_mut() },
                    ),
                    Holder::OptionalBoxed => (
                        quote! { r.#ident.as_deref() },
                        quote! { r.#ident.as_deref_mut() },
                    ),
                };
                accessors.push(quote! {
                    fn #get_fn(r: &#record) -> ::core::option::Option<&#inner> { #project }
                    fn #mut_fn(r: &mut #record) -> ::core::option::Option<&mut #inner> {
                        #project_mut
                    }
                });
                entries.push(quote! {
                    ::rowmap::FieldDef::<Self>::embedded::<#inner>(#name, #get_fn, #mut_fn) #tags
                });
            }
        }
    }

    quote! {
        impl ::rowmap::Record for #record {
            #[allow(non_snake_case)]
            fn fields() -> ::std::vec::Vec<::rowmap::FieldDef<Self>> {
                #(#accessors)*
                ::std::vec![#(#entries),*]
            }
        }
    }
}
