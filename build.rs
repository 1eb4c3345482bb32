//! Build script for the fleetd project.
//!
//! Ensures the project is recompiled when migration files change, which is
//! required for the `SQLx` `migrate!()` macro to pick up new migrations.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
