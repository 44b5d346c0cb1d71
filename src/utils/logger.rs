use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Фильтр по умолчанию, если RUST_LOG не задан
const DEFAULT_FILTER: &str = "warn,dubsync=info";
const VERBOSE_FILTER: &str = "warn,dubsync=debug";

pub fn init_logger(verbose: bool) {
    // RUST_LOG имеет приоритет над флагом --verbose
    let env = Env::default().filter_or("RUST_LOG", if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER });

    let mut builder = Builder::from_env(env);

    // Явно подавляем логи от шумных модулей
    builder
        .filter_module("hyper", LevelFilter::Error)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("symphonia", LevelFilter::Error)
        .filter_module("mio", LevelFilter::Error)
        .filter_module("tokio_util", LevelFilter::Error)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr);

    // повторная инициализация (например, из тестов) не считается ошибкой
    let _ = builder.try_init();
}
