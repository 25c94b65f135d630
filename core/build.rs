// generates the C header for the `capi` feature's extern "C" surface.

fn main() {
    #[cfg(feature = "capi")]
    generate_c_header();
}

#[cfg(feature = "capi")]
fn generate_c_header() {
    use std::env;
    use std::path::PathBuf;

    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let output_file = PathBuf::from(&crate_dir).join("include").join("cache_core.h");

    println!("cargo:rerun-if-changed=src/ffi.rs");

    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("CACHE_CORE_H")
        .with_pragma_once(true)
        .with_documentation(true)
        .with_namespace("cache_core")
        .rename_item("CacheHandle", "cache_core_handle_t")
        .with_header(
            "/**\n\
             * cache-core C API\n\
             *\n\
             * A loopback caching range proxy: init() starts the server and\n\
             * background completer, proxy_url_for() returns the local URL a\n\
             * media player should address instead of the origin.\n\
             */",
        )
        .generate()
        .expect("unable to generate C bindings")
        .write_to_file(&output_file);
}
