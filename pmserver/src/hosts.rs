use std::path::Path;

use log::info;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// containerd hosts.toml layout: <dir>/<registry-host>/hosts.toml. every configured
// upstream gets the local node as its first pull+resolve mirror, containerd falls
// back to the real registry when we miss
pub fn write_mirror_config(
    dir: &Path,
    mirror_url: &str,
    registries: &[String],
) -> Result<(), Error> {
    for registry in registries {
        let host_dir = dir.join(registry);
        std::fs::create_dir_all(&host_dir)?;
        let server = if registry == "docker.io" {
            "https://registry-1.docker.io".to_string()
        } else {
            format!("https://{registry}")
        };
        let content = format!(
            "server = \"{server}\"\n\n[host.\"{mirror_url}\"]\ncapabilities = [\"pull\", \"resolve\"]\n"
        );
        std::fs::write(host_dir.join("hosts.toml"), content)?;
        info!("wrote mirror config for {registry} at {:?}", host_dir);
    }
    Ok(())
}
