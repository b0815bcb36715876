//! Object dump - fetches programs into the catalog and saves a snapshot.
//!
//! This example demonstrates:
//! - Fetching objects through the session catalog
//! - Serving repeated reads from the cache
//! - Saving the catalog as a MessagePack snapshot
//!
//! # Running
//!
//! ```sh
//! cargo run --example dump --features midi -- "K2600" 120 130 programs.k2cat
//! ```

use k2_client::{ObjectKind, Session};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [port, first, last, path] = args.as_slice() else {
        eprintln!("usage: dump <port name> <first slot> <last slot> <snapshot file>");
        return Ok(());
    };
    let (first, last): (u16, u16) = (first.parse()?, last.parse()?);

    let session = Session::connect(port).await?;
    let catalog = session.catalog();

    for slot in first..=last {
        match catalog.get(ObjectKind::Program, slot).await? {
            Some(entry) => println!("{:>4}  {:<16}  {} bytes", slot, entry.name, entry.size()),
            None => println!("{:>4}  (empty)", slot),
        }
    }

    std::fs::write(path, catalog.snapshot().to_msgpack()?)?;
    println!("{} objects saved to {}", catalog.len(), path);

    session.close();
    Ok(())
}
