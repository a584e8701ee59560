//! Build script for meshwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `meshwall --version`.

fn main() {
    println!("cargo:rerun-if-env-changed=MESHWALL_NFT_COMMAND");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
