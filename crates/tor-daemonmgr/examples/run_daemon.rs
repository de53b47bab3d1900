//! Launch a tor binary, wait for bootstrap, and shut it down again.
//!
//! Usage: `run_daemon [path-to-tor] [state-dir]`

use std::sync::Arc;
use std::time::Duration;

use tor_daemonmgr::{DaemonMgr, ProvidedTor, TorEnv};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let tor = args.next().unwrap_or_else(|| "/usr/bin/tor".to_owned());
    let dir = args.next().unwrap_or_else(|| "./tor-state".to_owned());

    let env = TorEnv::new(format!("{}/work", dir), format!("{}/cache", dir))?;
    let mgr = DaemonMgr::builder(env)
        .installer(Arc::new(ProvidedTor::new(tor)))
        .take_ownership(true)
        .build()?;

    mgr.start()?.wait().await?;
    println!("tor is up ({}); waiting for bootstrap", mgr.status());
    tokio::time::timeout(Duration::from_secs(120), mgr.await_ready()).await?;
    println!("ready; socks listeners: {:?}", mgr.listeners().socks);

    for (key, value) in mgr.get_info(["version".to_owned()]).await? {
        println!("{} = {}", key, value);
    }

    mgr.stop()?.wait().await?;
    mgr.destroy().await;
    Ok(())
}
