use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

/// `$XDG_CONFIG_HOME`, falling back to `~/.config`.
pub fn config_dir() -> Option<PathBuf> {
    resolve_config_dir(env::var_os("XDG_CONFIG_HOME"), dirs_sys::home_dir())
}

fn resolve_config_dir(xdg: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    xdg.and_then(dirs_sys::is_absolute_path)
        .or_else(|| home.map(|home| home.join(".config")))
}
