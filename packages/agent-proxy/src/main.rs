use agent_proxy::cli::run_agent_proxy;

fn main() {
    if let Err(err) = run_agent_proxy() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
