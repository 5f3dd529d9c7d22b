//! Generates Swift and Kotlin bindings for `keybound-core`.

fn main() {
    uniffi::uniffi_bindgen_main();
}
