use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    MultiThread,
    CurrentThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::MultiThread,
        }
    }
}

/// Runs an async test on its own Tokio runtime and fails it once `secs`
/// (default 30) have elapsed.
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(secs = 5)]
/// async fn ping_round_trip() { ... }
/// ```
///
/// `flavor = "current_thread"` selects a single-threaded runtime; the default is
/// a two-worker multi-threaded runtime so spawned I/O tasks make progress while
/// the test body blocks on a reply.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TimeoutArgs::default();
    let arg_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(meta.error("secs must be greater than zero"));
            }
            Ok(())
        } else if meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            args.flavor = match lit.value().as_str() {
                "multi_thread" => Flavor::MultiThread,
                "current_thread" => Flavor::CurrentThread,
                other => {
                    return Err(meta.error(format!("unknown runtime flavor `{other}`")));
                }
            };
            Ok(())
        } else {
            Err(meta.error("expected `secs = N` or `flavor = \"...\"`"))
        }
    });
    parse_macro_input!(attr with arg_parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let name = sig.ident.to_string();
    let secs = args.secs;
    let builder = match args.flavor {
        Flavor::MultiThread => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(2)
        },
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            let outcome = runtime.block_on(async move {
                tokio::time::timeout(limit, async move #block).await
            });
            runtime.shutdown_timeout(std::time::Duration::from_millis(250));
            match outcome {
                Ok(value) => value,
                Err(_) => panic!("{} did not finish within {:?}", #name, limit),
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
