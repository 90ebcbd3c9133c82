use super::launch::{print_config, LaunchArgs, STARTSCRIPT};
use super::{colorize_state, json_pretty, registry, Failure, EXIT_SUCCESS};
use capsule_core::{BinaryStarter, InstanceRecord, LaunchConfigBuilder, StarterInvoker};
use capsule_schema::RuntimeConf;
use serde::Serialize;

pub fn start(
    conf: &RuntimeConf,
    args: LaunchArgs,
    image: &str,
    name: &str,
    process_args: &[String],
    json: bool,
) -> Result<u8, Failure> {
    let dry_run = args.dry_run();
    let opts = args.into_options()?;
    let builder = LaunchConfigBuilder::new(conf).with_registry(registry(conf));
    let config = builder.build(opts, image, STARTSCRIPT, process_args, Some(name))?;
    if dry_run {
        return print_config(&config);
    }

    let invoker = StarterInvoker::new(
        Box::new(BinaryStarter::new(conf.starter_dir.clone())),
        conf.suid_install,
    );
    let started = invoker.instance(name, &config, builder.registry())?;
    if !started.early_stderr.is_empty() {
        eprint!("{}", started.early_stderr);
    }
    if json {
        println!("{}", json_pretty(&started.record)?);
    } else {
        println!(
            "instance {name} started (pid {}), logs in {}",
            started.record.pid,
            started.record.log_err.display()
        );
    }
    Ok(EXIT_SUCCESS)
}

#[derive(Serialize)]
struct Listed<'a> {
    #[serde(flatten)]
    record: &'a InstanceRecord,
    state: &'static str,
}

fn state(record: &InstanceRecord) -> &'static str {
    if record.is_alive() {
        "running"
    } else {
        "stale"
    }
}

pub fn list(conf: &RuntimeConf, json: bool) -> Result<u8, Failure> {
    let records = registry(conf).list()?;
    if json {
        let listed: Vec<Listed<'_>> = records
            .iter()
            .map(|record| Listed {
                record,
                state: state(record),
            })
            .collect();
        println!("{}", json_pretty(&listed)?);
    } else if records.is_empty() {
        println!("no instances found");
    } else {
        println!(
            "{:<20} {:<8} {:<10} {:<26} IMAGE",
            "NAME", "PID", "STATE", "STARTED"
        );
        for r in &records {
            println!(
                "{:<20} {:<8} {:<10} {:<26} {}",
                r.name,
                r.pid,
                colorize_state(state(r)),
                r.started_at,
                r.image.display()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn stop(conf: &RuntimeConf, name: &str, force: bool, json: bool) -> Result<u8, Failure> {
    let record = registry(conf).stop(name, force)?;
    if json {
        println!("{}", json_pretty(&record)?);
    } else {
        println!("stopped instance {name} (pid {})", record.pid);
    }
    Ok(EXIT_SUCCESS)
}
