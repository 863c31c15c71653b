use anyhow::{bail, Context};
use clap::Parser;
use training::predict::{run_predict, PredictArgs};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = PredictArgs::parse();
    let model = args.model.clone();
    let summary =
        run_predict(args).with_context(|| format!("prediction with {} failed", model.display()))?;
    if !summary.all_passed() {
        bail!(
            "{} of {} expectations failed",
            summary.checked - summary.passed,
            summary.checked
        );
    }
    Ok(())
}
