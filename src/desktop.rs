//! Desktop integration: launcher entry, icon, and the version marker it reads.

use std::fs;
use std::io;
use std::path::Path;

pub struct ShortcutSpec<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub app_id: &'a str,
    pub package_command: &'a str,
    pub icon_path: &'a Path,
}

/// Trimmed marker contents, or `fallback` when missing, unreadable or blank.
pub fn read_version_marker(path: &Path, fallback: &str) -> String {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                fallback.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(_) => fallback.to_string(),
    }
}

pub fn render_shortcut(spec: &ShortcutSpec<'_>) -> String {
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={name}\n\
         Comment=Manage ZeroTier networks\n\
         Exec={command} run {app_id}\n\
         Icon={icon}\n\
         Terminal=false\n\
         Categories=Network;\n\
         X-ZTGUI-Version={version}\n",
        name = spec.name,
        command = spec.package_command,
        app_id = spec.app_id,
        icon = spec.icon_path.display(),
        version = spec.version,
    )
}

pub fn shortcut_version(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("X-ZTGUI-Version="))
}

/// Writes the launcher atomically and marks it executable.
pub fn write_shortcut(path: &Path, spec: &ShortcutSpec<'_>) -> io::Result<()> {
    write_atomic(path, render_shortcut(spec).as_bytes(), Some(0o755))
}

pub fn write_atomic(path: &Path, content: &[u8], mode: Option<u32>) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "ztgui".to_string()),
        std::process::id()
    ));
    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)
}

/// Removes a file if present. `Ok(false)` means there was nothing to remove.
pub fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec<'a>(version: &'a str, icon: &'a Path) -> ShortcutSpec<'a> {
        ShortcutSpec {
            name: "ZeroTier GUI",
            version,
            app_id: "io.github.aaron777collins.zerotier-gui",
            package_command: "flatpak",
            icon_path: icon,
        }
    }

    #[test]
    fn marker_is_trimmed() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("version");
        fs::write(&marker, "0.1.4\n").unwrap();
        assert_eq!(read_version_marker(&marker, "0.0.82"), "0.1.4");
    }

    #[test]
    fn missing_or_blank_marker_falls_back() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("version");
        assert_eq!(read_version_marker(&marker, "0.0.82"), "0.0.82");
        fs::write(&marker, "  \n").unwrap();
        assert_eq!(read_version_marker(&marker, "0.0.82"), "0.0.82");
    }

    #[test]
    fn shortcut_launches_the_bundle() {
        let icon = Path::new("/home/deck/.local/share/icons/zerotier-gui.png");
        let body = render_shortcut(&spec("0.0.82", icon));
        assert!(body.starts_with("[Desktop Entry]\n"));
        assert!(body.contains("Exec=flatpak run io.github.aaron777collins.zerotier-gui\n"));
        assert!(body.contains("Icon=/home/deck/.local/share/icons/zerotier-gui.png\n"));
        assert_eq!(shortcut_version(&body), Some("0.0.82"));
    }

    #[cfg(unix)]
    #[test]
    fn shortcut_is_executable_and_overwritten() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("Desktop/zerotier-gui.desktop");
        let icon = dir.path().join("icon.png");
        write_shortcut(&path, &spec("0.0.1", &icon)).unwrap();
        write_shortcut(&path, &spec("0.0.2", &icon)).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(shortcut_version(&content), Some("0.0.2"));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn remove_reports_absence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        assert!(!remove_if_present(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(remove_if_present(&path).unwrap());
        assert!(!path.exists());
    }
}
