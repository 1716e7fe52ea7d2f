//! Creates every item of a Config document in a namespace and prints the outcome of each one.
//!
//! `cargo run --example apply-config -- my-project ./config.yaml`
use origin_controller::apply::{known_types, Applier, ClientMappings, RestMapper};
use origin_controller::prelude::*;
use origin_controller::runner::client::Client;
use origin_controller::runner::metrics::Metrics;

use std::io;

async fn apply_file(namespace: &str, path: &str) -> Result<bool, Error> {
    let data = std::fs::read(path)?;
    let metrics = Metrics::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let client_config = ClientConfig::from_service_account("apply-config")
        .or_else(|_| ClientConfig::from_kubeconfig("apply-config"))?;
    let client = Client::new(client_config, metrics.client_metrics())?;
    let applier = Applier::new(
        RestMapper::default(),
        ClientMappings::for_client(&client, &known_types()),
    )
    .with_metrics(metrics.apply_metrics());

    let mut all_succeeded = true;
    for result in applier.apply(namespace, &data).await? {
        if result.is_success() {
            println!("{}", result.message);
        } else {
            all_succeeded = false;
            for error in result.errors.iter() {
                println!("Error: {}", error);
            }
        }
    }
    Ok(all_succeeded)
}

fn main() {
    env_logger::init();
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.len() != 2 {
        eprintln!("usage: apply-config <namespace> <file>");
        std::process::exit(2);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    match runtime.block_on(apply_file(&args[0], &args[1])) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    }
}
