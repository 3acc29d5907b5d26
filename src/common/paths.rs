use std::path::PathBuf;

// System install locations; DevMode overrides these for local runs

pub fn system_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fingertime")
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/fingertime/fingertime.toml")
}

pub fn local_config_file() -> PathBuf {
    PathBuf::from("configs/fingertime.toml")
}
