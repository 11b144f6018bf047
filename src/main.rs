use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();

    let config = mistest::cli::parse()?;
    let scheduler = mistest::scheduler::Scheduler::new(&config.resources, config.tree.clone());
    let mut sink = mistest::output::Sink::new(
        config.immediate,
        config.prefix_with_resource,
        config.junit_xml_path.clone(),
    );

    scheduler.run(&mut sink);
    let ok = sink.finish(&config.tree)?;

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
