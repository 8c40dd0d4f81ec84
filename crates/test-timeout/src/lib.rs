//! `#[tokio_timeout_test]`: an async test that fails instead of hanging.
//!
//! The body runs on a current-thread runtime in its own thread. The limit
//! defaults to 30 seconds, may be given as `#[tokio_timeout_test(10)]`, and
//! is multiplied at run time by `BEACH_TEST_TIMEOUT_SCALE` when set.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr.into()) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);
    match expand(secs, function) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

fn expand(secs: u64, function: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;
    if sig.asyncness.take().is_none() {
        return Err(syn::Error::new_spanned(
            &sig.fn_token,
            "tokio_timeout_test expects an async fn",
        ));
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !is_test_marker(attr)).collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let scale = std::env::var("BEACH_TEST_TIMEOUT_SCALE")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|scale| *scale > 0)
                .unwrap_or(1);
            let limit = std::time::Duration::from_secs(#secs * scale);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("build test runtime")
                        .block_on(async move {
                            if tokio::time::timeout(limit, async move #block).await.is_err() {
                                panic!("test exceeded {:?}", limit);
                            }
                        })
                }));
                let _ = done_tx.send(outcome);
            });
            // Backstop for bodies that block the runtime thread.
            match done_rx.recv_timeout(limit + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(_) => panic!("test exceeded {:?} with its runtime blocked", limit),
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would double-register the function.
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}
