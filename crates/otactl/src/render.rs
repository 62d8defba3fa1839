//! Output rendering for otactl.

use ota_core::registry::{ExtensionDescriptor, ExtensionKind, ExtensionRegistry};
use std::path::Path;

/// Print confirmation after registering an extension.
pub fn print_registered(kind: &str, key: Option<&str>, descriptor: &ExtensionDescriptor) {
    match key {
        Some(key) => println!("Registered {kind} for {key}"),
        None => println!("Registered {kind}"),
    }
    println!("  Path:   {}", descriptor.file_name);
    println!("  Size:   {} bytes", descriptor.size_in_bytes);
    if let Some(sha256) = descriptor.hashes.get("sha256") {
        println!("  Sha256: {sha256}");
    }
}

/// Print every registered extension in tabular form.
pub fn print_registry(registry: &ExtensionRegistry) {
    println!("{:<24}  {:<28}  {}", "KIND", "KEY", "PATH");
    println!("{}", "-".repeat(80));
    let mut count = 0;

    for kind in [
        ExtensionKind::ContentHandler,
        ExtensionKind::UpdateManifestHandler,
        ExtensionKind::DownloadHandler,
    ] {
        let Ok(keys) = registry.list_keys(kind) else {
            continue;
        };
        for key in keys {
            if let Ok(descriptor) = registry.resolve(kind, Some(&key)) {
                println!(
                    "{:<24}  {:<28}  {}",
                    kind.as_str(),
                    key,
                    descriptor.file_name
                );
                count += 1;
            }
        }
    }
    for kind in [
        ExtensionKind::ContentDownloader,
        ExtensionKind::ComponentEnumerator,
    ] {
        if let Ok(descriptor) = registry.resolve(kind, None) {
            println!("{:<24}  {:<28}  {}", kind.as_str(), "-", descriptor.file_name);
            count += 1;
        }
    }

    println!();
    println!("{count} extension(s)");
}

/// Pretty-print the workflow snapshot file.
pub fn print_snapshot(path: &Path) {
    match std::fs::read_to_string(path) {
        Ok(json) => match serde_json::from_str::<serde_json::Value>(&json) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or(json)),
            Err(_) => println!("{json}"),
        },
        Err(_) => println!("No snapshot at {}", path.display()),
    }
}
