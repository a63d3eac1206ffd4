use broker::cli::Args;

pub fn main() -> anyhow::Result<()> {
    let args = argh::from_env::<Args>();
    args.run()
}
