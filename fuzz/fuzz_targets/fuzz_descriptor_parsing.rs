//! Fuzz target for store descriptor parsing.
//!
//! Checks that:
//! 1. No input causes a panic in the JSON or TOML parsers
//! 2. Validation of any parsed descriptor returns instead of panicking
//! 3. Accessors on a valid descriptor stay within their documented bounds
//!
//! Run with: `cargo +nightly fuzz run fuzz_descriptor_parsing`

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use unistore::Descriptor;

#[derive(Arbitrary, Debug)]
struct DescriptorInput {
    source: String,
    format: Format,
}

#[derive(Arbitrary, Debug)]
enum Format {
    Json,
    Toml,
}

fuzz_target!(|input: DescriptorInput| {
    let parsed = match input.format {
        Format::Json => Descriptor::from_json(&input.source),
        Format::Toml => Descriptor::from_toml(&input.source),
    };
    let Ok(descriptor) = parsed else {
        return;
    };
    if descriptor.validate().is_ok() {
        assert!(descriptor.capacity() > 0);
        assert!(descriptor.cache_size() > 0);
        assert!(!descriptor.persist_interval().is_zero());
        assert!(!descriptor.cleanup_interval().is_zero());
        assert!(!descriptor.table().is_empty());
    }
});
