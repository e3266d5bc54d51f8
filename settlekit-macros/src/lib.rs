//! Procedural macros for settlekit
//!
//! This crate provides the `#[settlekit::test]` attribute macro for writing
//! async tests against an instrumented target.
//!
//! # Example
//!
//! ```rust,ignore
//! use settlekit::prelude::*;
//!
//! #[settlekit::test]
//! async fn my_test(target: Target) {
//!     target.define_function("ping", |_args| Value::Int(1));
//!     assert_eq!(target.call("ping", &[]).unwrap(), Value::Int(1));
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, FnArg, Ident, ItemFn, Lit, Pat, Token, Type,
};

/// Configuration options for the test macro.
#[derive(Default)]
struct TestConfig {
    /// Which async runtime to use ("tokio" or "async-std")
    runtime: Option<String>,
    /// Flavor for tokio runtime ("current_thread" or "multi_thread")
    flavor: Option<String>,
}

impl Parse for TestConfig {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut config = TestConfig::default();

        while !input.is_empty() {
            let ident: Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            match ident.to_string().as_str() {
                "runtime" => {
                    let lit: Lit = input.parse()?;
                    if let Lit::Str(s) = lit {
                        config.runtime = Some(s.value());
                    }
                }
                "flavor" => {
                    let lit: Lit = input.parse()?;
                    if let Lit::Str(s) = lit {
                        config.flavor = Some(s.value());
                    }
                }
                _ => {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("unknown attribute: {ident}"),
                    ));
                }
            }

            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(config)
    }
}

/// Determines if a function parameter is requesting a fresh Target.
fn is_target_param(arg: &FnArg) -> bool {
    if let FnArg::Typed(pat_type) = arg {
        if let Type::Path(type_path) = &*pat_type.ty {
            if let Some(segment) = type_path.path.segments.last() {
                return segment.ident == "Target";
            }
        }
    }
    false
}

/// Extracts the parameter name from a function argument.
fn get_param_name(arg: &FnArg) -> Option<&Pat> {
    if let FnArg::Typed(pat_type) = arg {
        Some(&pat_type.pat)
    } else {
        None
    }
}

/// Test attribute macro for async tests against an instrumented target.
///
/// The macro wraps an async test function in the selected runtime and, when
/// the test declares a `target: Target` parameter, injects a fresh dynamic
/// target for the test body to instrument.
///
/// # Basic Usage
///
/// ```rust,ignore
/// #[settlekit::test]
/// async fn test_basic() {
///     // Test runs with tokio by default
///     assert!(true);
/// }
/// ```
///
/// # With Target Injection
///
/// Add a `target: Target` parameter to automatically receive a fresh target:
///
/// ```rust,ignore
/// use settlekit::prelude::*;
///
/// #[settlekit::test]
/// async fn test_with_target(target: Target) {
///     target.define_function("ping", |_args| Value::Unit);
///     assert!(target.call("ping", &[]).is_ok());
/// }
/// ```
///
/// # Configuration Options
///
/// - `runtime = "tokio"` or `runtime = "async-std"` - Select the async runtime
/// - `flavor = "multi_thread"` - Tokio runtime flavor
///
/// ```rust,ignore
/// #[settlekit::test(flavor = "multi_thread")]
/// async fn test_parallel(target: Target) {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let config = parse_macro_input!(attr as TestConfig);
    let input = parse_macro_input!(item as ItemFn);

    expand_test(config, input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_test(config: TestConfig, input: ItemFn) -> syn::Result<TokenStream2> {
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    // Check if function is async
    if input.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &input.sig,
            "test function must be async",
        ));
    }

    // Check for target parameter
    let needs_target = input.sig.inputs.iter().any(is_target_param);
    let target_param_name = input
        .sig
        .inputs
        .iter()
        .find(|arg| is_target_param(arg))
        .and_then(get_param_name);

    // Generate target initialization
    let target_init = if needs_target {
        let target_name = target_param_name.unwrap();
        quote! {
            let #target_name = ::settlekit::target::Target::new();
        }
    } else {
        quote! {}
    };

    // Determine runtime and generate wrapper
    let runtime = config.runtime.as_deref().unwrap_or("tokio");
    let flavor = config.flavor.as_deref().unwrap_or("current_thread");

    let runtime_wrapper = match runtime {
        "tokio" => {
            let flavor_attr = match flavor {
                "multi_thread" => quote! { #[::tokio::test(flavor = "multi_thread")] },
                _ => quote! { #[::tokio::test] },
            };
            quote! {
                #flavor_attr
                #(#attrs)*
                #vis async fn #name() {
                    #target_init
                    #body
                }
            }
        }
        "async-std" => {
            quote! {
                #[::async_std::test]
                #(#attrs)*
                #vis async fn #name() {
                    #target_init
                    #body
                }
            }
        }
        _ => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("unsupported runtime: {runtime}. Use \"tokio\" or \"async-std\""),
            ));
        }
    };

    Ok(runtime_wrapper)
}
