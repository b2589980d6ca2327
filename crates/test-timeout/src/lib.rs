//! `#[tokio_timeout_test]` runs an async test on its own current-thread
//! runtime and fails it when it outlives its budget.
//!
//! Arguments are comma separated and optional:
//! - an integer (or `secs = N`): timeout in seconds, default 60;
//! - `paused`: start the runtime with a paused clock so timers auto-advance.
//!   Requires tokio's `test-util` feature in the calling crate.

use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprAssign, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

impl TestOptions {
    fn parse(args: Punctuated<Expr, Token![,]>) -> syn::Result<Self> {
        let mut options = Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for arg in args {
            match arg {
                Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }) => options.timeout_secs = lit.base10_parse()?,
                Expr::Assign(ExprAssign { left, right, .. }) if is_ident(&left, "secs") => {
                    match *right {
                        Expr::Lit(ExprLit {
                            lit: Lit::Int(lit), ..
                        }) => options.timeout_secs = lit.base10_parse()?,
                        other => {
                            return Err(syn::Error::new_spanned(
                                other,
                                "`secs` expects an integer literal",
                            ))
                        }
                    }
                }
                Expr::Path(ref path) if is_path(path, "paused") => options.paused = true,
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "expected a timeout in seconds, `secs = N`, or `paused`",
                    ))
                }
            }
        }
        if options.timeout_secs == 0 {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "timeout must be greater than zero",
            ));
        }
        Ok(options)
    }
}

fn is_path(path: &ExprPath, name: &str) -> bool {
    path.qself.is_none() && path.path.is_ident(name)
}

fn is_ident(expr: &Expr, name: &str) -> bool {
    matches!(expr, Expr::Path(path) if is_path(path, name))
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Expr, Token![,]>::parse_terminated);
    let options = match TestOptions::parse(args) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    let pause_clock = if options.paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };
    // Paused clocks advance virtually, so the wall-clock guard gets headroom.
    let wall_clock_factor: u32 = if options.paused { 2 } else { 1 };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause_clock
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration * #wall_clock_factor) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
