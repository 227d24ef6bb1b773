use anyhow::Context;
use anyhow::Result;
use herd_core::HerdConfig;

use crate::ConfigArgs;

pub fn run(args: &ConfigArgs) -> Result<()> {
    let config = load(args)?;
    let rendered = config
        .to_toml()
        .map_err(anyhow::Error::msg)
        .context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

pub(crate) fn load(args: &ConfigArgs) -> Result<HerdConfig> {
    HerdConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))
}
