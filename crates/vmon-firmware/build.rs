//! Access point defaults and linker setup
//!
//! `VMON_AP_SSID` and `VMON_AP_PASSWORD` are taken from the environment or a
//! `.env` file next to the workspace root. They are only used when the SD
//! card carries no `WIFI.TXT`.

const DEFAULT_SSID: &str = "vmon";
const DEFAULT_PASSWORD: &str = "vmon-logger";

fn main() {
    // Missing .env is fine, the defaults below apply
    let _ = dotenvy::dotenv();

    for (key, default) in [
        ("VMON_AP_SSID", DEFAULT_SSID),
        ("VMON_AP_PASSWORD", DEFAULT_PASSWORD),
    ] {
        let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
        println!("cargo:rustc-env={key}={value}");
        println!("cargo:rerun-if-env-changed={key}");
    }
    println!("cargo:rerun-if-changed=.env");

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
