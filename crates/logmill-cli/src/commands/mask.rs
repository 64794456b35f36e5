use std::path::PathBuf;

use logmill_core::LogmillError;
use logmill_engine::Masker;

pub fn run(config: Option<PathBuf>, text: String) -> Result<(), LogmillError> {
    let config = super::load_config(config.as_deref())?;
    let masker = Masker::new(&config.masker);
    println!("{}", masker.mask(&text));
    Ok(())
}
