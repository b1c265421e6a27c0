use std::sync::Once;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

static INIT: Once = Once::new();

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} [{l}] {t} - {m}{n}";
const LOG_FILE: &str = "logs/pharmagenie.log";

/// Install log4rs from `LOG4RS_CONFIG` (default `log4rs.yaml`), falling back
/// to console plus `logs/pharmagenie.log`.
pub fn init_logger() {
    INIT.call_once(|| {
        let config_path =
            std::env::var("LOG4RS_CONFIG").unwrap_or_else(|_| "log4rs.yaml".to_string());
        let _ = std::fs::create_dir_all("logs");
        if log4rs::init_file(&config_path, Default::default()).is_ok() {
            log::info!("logger initialised from {config_path}");
            return;
        }

        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build();
        let mut builder =
            Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
        let mut root = Root::builder().appender("stdout");

        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(LOG_FILE)
        {
            Ok(file) => {
                builder = builder.appender(Appender::builder().build("logfile", Box::new(file)));
                root = root.appender("logfile");
            }
            Err(err) => eprintln!("[init] failed to open {LOG_FILE}: {err}"),
        }

        let config = match builder.build(root.build(LevelFilter::Info)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("[init] failed to build logger config: {err}");
                return;
            }
        };
        if let Err(err) = log4rs::init_config(config) {
            eprintln!("[init] failed to initialise logger: {err}");
        }
    });
}
