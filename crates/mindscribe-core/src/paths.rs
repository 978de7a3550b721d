use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub credentials_path: PathBuf,
    pub logs_dir: PathBuf,
}

pub fn resolve_app_paths() -> anyhow::Result<AppPaths> {
    let root = if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("mindscribe")
    } else {
        dirs::home_dir()
            .map(|home| home.join(".mindscribe"))
            .ok_or_else(|| anyhow::anyhow!("failed to resolve a data directory"))?
    };

    Ok(AppPaths {
        config_path: root.join("config.json"),
        credentials_path: root.join("credentials.json"),
        logs_dir: mindscribe_observability::logs_dir_under(&root),
        root,
    })
}
