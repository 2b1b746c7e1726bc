//! Built-in demo extensions.
//!
//! Every demo service answers `getInfo` with a small description of itself.

use relay_extensions::{ExtensionCatalog, Registrar};
use relay_kernel::{Fault, ServiceProvider};
use serde_json::{Value, json};

pub const ARITHMETIC: &str = "demo/arithmetic";
pub const GREETER: &str = "demo/greeter";
pub const BROKEN: &str = "demo/broken";

/// Catalog with every demo extension.
pub fn catalog() -> ExtensionCatalog {
    ExtensionCatalog::new()
        .with_extension(ARITHMETIC, load_arithmetic)
        .with_extension(GREETER, load_greeter)
        .with_extension(BROKEN, |_| {
            Err(Fault::named("LoadFailure", "the broken demo never loads"))
        })
}

fn info(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

fn load_arithmetic(registrar: &Registrar) -> Result<(), Fault> {
    let provider = ServiceProvider::builder()
        .method("getInfo", |_| Ok(info("arithmetic", "Arithmetic")))
        .method("add", |inv| {
            let a: f64 = inv.arg_as(0)?;
            let b: f64 = inv.arg_as(1)?;
            Ok(json!(a + b))
        })
        .method("double", |inv| {
            let n: f64 = inv.arg_as(0)?;
            Ok(json!(n * 2.0))
        })
        .build()
        .map_err(|e| e.to_fault())?;
    drop(registrar.register(provider));
    Ok(())
}

fn load_greeter(registrar: &Registrar) -> Result<(), Fault> {
    let greeter = ServiceProvider::builder()
        .method("getInfo", |_| Ok(info("greeter", "Greeter")))
        .method("greet", |inv| {
            let name: String = inv.arg_as(0)?;
            Ok(json!(format!("Hello, {name}!")))
        })
        .build()
        .map_err(|e| e.to_fault())?;

    let shouter = ServiceProvider::builder()
        .method("getInfo", |_| Ok(info("shouter", "Shouter")))
        .method("shout", |inv| {
            let text: String = inv.arg_as(0)?;
            Ok(json!(text.to_uppercase()))
        })
        .build()
        .map_err(|e| e.to_fault())?;

    drop(registrar.register(greeter));
    drop(registrar.register(shouter));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_every_demo() {
        assert_eq!(catalog().locations(), vec![ARITHMETIC, BROKEN, GREETER]);
    }
}
