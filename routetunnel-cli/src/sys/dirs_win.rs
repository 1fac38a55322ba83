use std::path::PathBuf;

/// Roaming `AppData`.
pub fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}
