use color_eyre::eyre::Result;

fn main() -> Result<()> {
    pg_upkeep::run_cli()
}
