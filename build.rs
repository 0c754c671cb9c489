use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

fn main() {
    for var in ["OTA_PUBLIC_KEY", "OTA_PUBLIC_KEY_X", "OTA_PUBLIC_KEY_Y"] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rerun-if-env-changed=BRIDGE_DEFAULT_NAME");
    println!("cargo:rerun-if-env-changed=BRIDGE_DEFAULT_PIN");
    println!("cargo:rerun-if-env-changed=BATTERY_ADC_CHANNEL");

    let key = ota_public_key();
    let mut generated = String::new();
    match &key {
        Some(bytes) => {
            let _ = write!(generated, "pub const OTA_PUBLIC_KEY: Option<&[u8]> = Some(&{bytes:?});");
        }
        None => {
            println!("cargo:warning=OTA public key not set; firmware updates will be unavailable");
            generated.push_str("pub const OTA_PUBLIC_KEY: Option<&[u8]> = None;");
        }
    }

    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    fs::write(out.join("ota_key.rs"), generated).expect("write ota_key.rs");

    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}

/// SEC1 public key bytes from either `OTA_PUBLIC_KEY` (full point, hex) or
/// the `OTA_PUBLIC_KEY_X` / `OTA_PUBLIC_KEY_Y` coordinate pair.
fn ota_public_key() -> Option<Vec<u8>> {
    if let Ok(point) = env::var("OTA_PUBLIC_KEY") {
        let bytes = hex::decode(point.trim()).expect("OTA_PUBLIC_KEY must be hex");
        assert!(
            matches!(bytes.len(), 33 | 65),
            "OTA_PUBLIC_KEY must be a 33 or 65 byte SEC1 point"
        );
        return Some(bytes);
    }

    let x = env::var("OTA_PUBLIC_KEY_X").ok()?;
    let y = env::var("OTA_PUBLIC_KEY_Y").ok()?;
    let x = hex::decode(x.trim()).expect("OTA_PUBLIC_KEY_X must be hex");
    let y = hex::decode(y.trim()).expect("OTA_PUBLIC_KEY_Y must be hex");
    assert!(
        x.len() == 32 && y.len() == 32,
        "OTA public key coordinates must be 32 bytes each"
    );

    let mut point = Vec::with_capacity(65);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);
    Some(point)
}
