mod config;
mod error;
mod logging;
mod model;
mod onnx;
mod pipeline;
mod sample;
mod trace;
mod wrapper;

#[cfg(test)]
mod test_support;

use crate::config::ExportConfig;
use crate::pipeline::RunOutcome;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", config::USAGE);
        return;
    }

    let cfg = match ExportConfig::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[embed-export] {e:#}");
            eprintln!("{}", config::USAGE);
            std::process::exit(2);
        }
    };

    match real_main(&cfg) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Keep stderr noisy for bug reports; logs also go to file.
            eprintln!("[embed-export] fatal error: {e:?}");
            log::error!("Fatal error: {:?}", e);
            std::process::exit(1);
        }
    }
}

fn real_main(cfg: &ExportConfig) -> anyhow::Result<i32> {
    let _logger = logging::init_logging(&cfg.log_dir)?;

    log::info!("=== Export started: {} ===", cfg.model.display_name());
    log::info!(
        "onnx_dir={}, assets_dir={}, max_seq_length={}, batch_size={}, opset={}, fold_constants={}",
        cfg.onnx_dir.display(),
        cfg.assets_dir.display(),
        cfg.max_seq_length,
        cfg.batch_size,
        cfg.opset_version,
        cfg.fold_constants
    );

    let outcome = pipeline::run(cfg)?;
    match &outcome {
        RunOutcome::Complete(_) => log::info!("=== Export finished ==="),
        RunOutcome::Incomplete(report) => log::warn!(
            "=== Export finished without tokenizer: {} ===",
            report.tokenizer_error.as_deref().unwrap_or("unknown reason")
        ),
        RunOutcome::Failed(_) => log::error!("=== Export failed ==="),
    }
    Ok(outcome.exit_code())
}
