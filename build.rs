// build.rs - link a CBLAS provider for sgemm/sgemv when --features blas is enabled
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=ECHOLALIA_BLAS_LIB");
    if std::env::var("CARGO_FEATURE_BLAS").is_err() {
        return;
    }
    if let Ok(lib) = std::env::var("ECHOLALIA_BLAS_LIB") {
        println!("cargo:rustc-link-lib={}", lib);
    } else if cfg!(target_os = "macos") {
        println!("cargo:rustc-link-lib=framework=Accelerate");
    } else {
        println!("cargo:rustc-link-lib=openblas");
    }
}
