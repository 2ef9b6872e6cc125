use crate::config::SAMPLE_CONFIG;
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    // Prefer ~/.config/fleetline/config.yml, fall back to /etc/fleetline/config.yml
    let user_config = dirs::home_dir()
        .map(|home| home.join(".config/fleetline/config.yml"))
        .filter(|path| match path.parent() {
            Some(parent) => match fs::create_dir_all(parent) {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("Warning: Could not create directory {}: {}", parent.display(), e);
                    eprintln!("Falling back to /etc/fleetline/config.yml");
                    false
                }
            },
            None => false,
        });

    let config_path = user_config.unwrap_or_else(|| PathBuf::from("/etc/fleetline/config.yml"));
    write_new_config(&config_path, SAMPLE_CONFIG)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// Write `content` to `path`, refusing to replace an existing file.
pub fn write_new_config(path: &Path, content: &str) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            path.display()
        )
        .into());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());
    crate::config::load_config(&path)?;
    println!("Config is valid");
    Ok(())
}
