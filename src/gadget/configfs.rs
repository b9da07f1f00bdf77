//! ConfigFS and sysfs file operations for the USB gadget

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{AppError, Result};

/// USB device version
pub const USB_BCD_DEVICE: u16 = 0x0100;

/// USB spec version (USB 2.0)
pub const USB_BCD_USB: u16 = 0x0200;

/// Find an available UDC (USB Device Controller) under `class_dir`
///
/// Names are sorted so the pick is stable across calls.
pub fn find_udc(class_dir: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(class_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Whether the gadget at `gadget_path` is bound to a controller
pub fn is_bound(gadget_path: &Path) -> bool {
    fs::read_to_string(gadget_path.join("UDC"))
        .map(|content| !content.trim().is_empty())
        .unwrap_or(false)
}

/// Write string content to a configfs attribute
///
/// Attributes take the value on the first write() syscall, so the complete
/// buffer (including the newline) is built first and written once.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    // Same open flags as `echo "" > UDC`; configfs attributes accept O_TRUNC
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .or_else(|e| {
            if path.exists() {
                Err(e)
            } else {
                File::create(path)
            }
        })
        .map_err(|e| AppError::Gadget(format!("Failed to open {}: {}", path.display(), e)))?;

    let data: std::borrow::Cow<[u8]> = if content.ends_with('\n') {
        content.as_bytes().into()
    } else {
        let mut buf = content.as_bytes().to_vec();
        buf.push(b'\n');
        buf.into()
    };

    file.write_all(&data)
        .map_err(|e| AppError::Gadget(format!("Failed to write to {}: {}", path.display(), e)))?;
    file.flush()
        .map_err(|e| AppError::Gadget(format!("Failed to flush {}: {}", path.display(), e)))?;

    Ok(())
}

/// Read string content from a file, trimmed
pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| AppError::Gadget(format!("Failed to read {}: {}", path.display(), e)))
}

/// Create directory if not exists
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        AppError::Gadget(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

/// Remove an (empty) directory if it exists
pub fn remove_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir(path).map_err(|e| {
            AppError::Gadget(format!(
                "Failed to remove directory {}: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Remove a file or symlink if it exists
pub fn remove_file(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path).map_err(|e| {
            AppError::Gadget(format!("Failed to remove file {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// Create symlink
pub fn create_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(src, dest).map_err(|e| {
        AppError::Gadget(format!(
            "Failed to create symlink {} -> {}: {}",
            dest.display(),
            src.display(),
            e
        ))
    })
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Remove a gadget tree without knowing how it was built
///
/// configfs only allows removal leaves first: os_desc links, function
/// links, config strings, configs, functions, gadget strings, then the
/// gadget itself.
/// Intermediate failures are logged; the result of the final removal is
/// returned.
pub fn teardown_gadget(gadget_path: &Path) -> Result<()> {
    if !gadget_path.exists() {
        return Ok(());
    }

    for link in entries(&gadget_path.join("os_desc"))
        .into_iter()
        .filter(|p| is_symlink(p))
    {
        if let Err(e) = remove_file(&link) {
            warn!("{}", e);
        }
    }

    for config in entries(&gadget_path.join("configs")) {
        for link in entries(&config).into_iter().filter(|p| is_symlink(p)) {
            if let Err(e) = remove_file(&link) {
                warn!("{}", e);
            }
        }
        for lang in entries(&config.join("strings")) {
            if let Err(e) = remove_dir(&lang) {
                warn!("{}", e);
            }
        }
        if let Err(e) = remove_dir(&config) {
            warn!("{}", e);
        }
    }

    for dir in entries(&gadget_path.join("functions"))
        .into_iter()
        .chain(entries(&gadget_path.join("strings")))
    {
        if let Err(e) = remove_dir(&dir) {
            warn!("{}", e);
        }
    }

    remove_dir(gadget_path)
}
