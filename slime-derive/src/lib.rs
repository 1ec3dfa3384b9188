//! Derive macros for the slime simulation engine.
//!
//! This crate provides one derive macro:
//!
//! - [`GpuStruct`] - Generates the WGSL struct definition for a `#[repr(C)]` Pod struct
//!
//! # Usage
//!
//! The macro is re-exported from the main `slime` crate. You don't need
//! to add this crate directly:
//!
//! ```ignore
//! use slime::GpuStruct;
//!
//! #[repr(C)]
//! #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, GpuStruct)]
//! struct Agent {
//!     position: [f32; 2],
//!     heading: f32,
//!     _pad: u32,
//! }
//! ```
//!
//! # Layout Rules
//!
//! The Rust struct is the source of truth: the generated WGSL struct must
//! place every field at the same byte offset. Supported field types:
//!
//! | Rust | WGSL | size | align |
//! |------|------|------|-------|
//! | `f32` / `u32` / `i32` | same | 4 | 4 |
//! | `[f32; 2]` / `[u32; 2]` | `vec2<f32>` / `vec2<u32>` | 8 | 8 |
//! | `[f32; 4]` / `[u32; 4]` | `vec4<f32>` / `vec4<u32>` | 16 | 16 |
//!
//! Fields whose name starts with `_` and whose type is `[u32; N]` or `[f32; N]`
//! are padding and expand to `N` scalar members in WGSL, because arrays of
//! scalars are not allowed in the uniform address space.
//!
//! If WGSL alignment would move a field away from its `repr(C)` offset the
//! derive fails with an error naming the field, so the mismatch never reaches
//! a shader.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Type};

/// Derive macro for GPU-shared structs.
///
/// # Generated Items
///
/// - `impl slime::GpuStruct for T` with `WGSL_NAME`, `WGSL_STRUCT` and `WGSL_SIZE`
/// - A compile-time assertion that `size_of::<T>() == WGSL_SIZE`
///
/// # Example
///
/// ```ignore
/// #[repr(C)]
/// #[derive(Clone, Copy, Pod, Zeroable, GpuStruct)]
/// struct Params {
///     width: u32,
///     height: u32,
///     _pad: [u32; 2],
///     color: [f32; 4],
/// }
///
/// // struct Params {
/// //     width: u32,
/// //     height: u32,
/// //     _pad_0: u32,
/// //     _pad_1: u32,
/// //     color: vec4<f32>,
/// // };
/// ```
#[proc_macro_derive(GpuStruct)]
pub fn derive_gpu_struct(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_gpu_struct(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_gpu_struct(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let name_str = name.to_string();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "GpuStruct derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "GpuStruct derive only supports structs",
            ))
        }
    };

    let mut wgsl_fields = Vec::new();
    let mut offset = 0u32;
    let mut struct_align = 4u32;

    for field in fields.iter() {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let field_name = ident.to_string();
        let info = wgsl_type_info(&field.ty, field_name.starts_with('_'))
            .ok_or_else(|| {
                syn::Error::new_spanned(
                    &field.ty,
                    format!(
                        "unsupported type for GPU field `{}`: {}",
                        field_name,
                        type_string(&field.ty)
                    ),
                )
            })?;

        // repr(C) aligns everything here to 4 bytes; WGSL may want more.
        if offset % info.align != 0 {
            return Err(syn::Error::new_spanned(
                ident,
                format!(
                    "field `{}` sits at offset {} but WGSL requires {}-byte alignment; add explicit padding before it",
                    field_name, offset, info.align
                ),
            ));
        }
        struct_align = struct_align.max(info.align);

        match info.kind {
            FieldKind::Plain(wgsl_type) => {
                wgsl_fields.push(format!("    {}: {},", field_name, wgsl_type));
            }
            FieldKind::Padding { scalar, count } => {
                for i in 0..count {
                    wgsl_fields.push(format!("    {}_{}: {},", field_name, i, scalar));
                }
            }
        }
        offset += info.size;
    }

    if offset % struct_align != 0 {
        return Err(syn::Error::new_spanned(
            name,
            format!(
                "struct `{}` is {} bytes but WGSL rounds it up to a multiple of {}; add trailing padding",
                name_str, offset, struct_align
            ),
        ));
    }

    let wgsl_struct = format!("struct {} {{\n{}\n}};\n", name_str, wgsl_fields.join("\n"));
    let wgsl_size = offset as usize;

    Ok(quote! {
        impl slime::GpuStruct for #name {
            const WGSL_NAME: &'static str = #name_str;
            const WGSL_STRUCT: &'static str = #wgsl_struct;
            const WGSL_SIZE: usize = #wgsl_size;
        }

        const _: () = assert!(
            ::std::mem::size_of::<#name>() == #wgsl_size,
            "GpuStruct layout does not match the Rust struct size"
        );
    })
}

enum FieldKind {
    Plain(&'static str),
    Padding { scalar: &'static str, count: u32 },
}

/// WGSL mapping for a single Rust field.
struct TypeInfo {
    kind: FieldKind,
    /// Size in bytes
    size: u32,
    /// Required WGSL alignment in bytes
    align: u32,
}

fn type_string(ty: &Type) -> String {
    quote!(#ty).to_string().replace(' ', "")
}

/// Map a Rust field type to its WGSL equivalent and alignment requirements.
fn wgsl_type_info(ty: &Type, is_padding: bool) -> Option<TypeInfo> {
    let type_str = type_string(ty);

    let plain = |wgsl: &'static str, size: u32, align: u32| TypeInfo {
        kind: FieldKind::Plain(wgsl),
        size,
        align,
    };

    match type_str.as_str() {
        "f32" => return Some(plain("f32", 4, 4)),
        "u32" => return Some(plain("u32", 4, 4)),
        "i32" => return Some(plain("i32", 4, 4)),
        _ => {}
    }

    let inner = type_str.strip_prefix('[')?.strip_suffix(']')?;
    let (elem, len) = inner.split_once(';')?;
    let len: u32 = len.trim_end_matches("usize").parse().ok()?;
    let scalar = match elem {
        "f32" => "f32",
        "u32" => "u32",
        _ => return None,
    };

    if is_padding {
        return Some(TypeInfo {
            kind: FieldKind::Padding { scalar, count: len },
            size: 4 * len,
            align: 4,
        });
    }

    match (scalar, len) {
        ("f32", 2) => Some(plain("vec2<f32>", 8, 8)),
        ("u32", 2) => Some(plain("vec2<u32>", 8, 8)),
        ("f32", 4) => Some(plain("vec4<f32>", 16, 16)),
        ("u32", 4) => Some(plain("vec4<u32>", 16, 16)),
        _ => None,
    }
}
