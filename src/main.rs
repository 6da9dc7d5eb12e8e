use pipesh::{
    config::{Args, Config},
    helper::DynError,
    logging,
    shell::Shell,
};

fn main() -> Result<(), DynError> {
    let args: Args = argh::from_env();
    let config = Config::try_from(args)?;
    logging::init_logging();

    Shell::new(config).run()
}
