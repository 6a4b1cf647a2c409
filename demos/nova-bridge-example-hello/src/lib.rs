//! Example guest: build with `cargo build -p nova-bridge-example-hello --target wasm32-unknown-unknown`
//! and run the resulting `.wasm` with `nova-bridge run`.

use nova_bridge_abi::guest::{release, HostFunction};
use nova_bridge_abi::InvokeParam;

nova_bridge_abi::export_allocator!();

#[cfg_attr(target_arch = "wasm32", no_mangle)]
pub extern "C" fn main() {
    let log = HostFunction::register("(message) => console.log(message)");
    let greet = HostFunction::register("(name) => 'Hello, ' + name + '!'");
    let hypot = HostFunction::register("(x, y) => Math.hypot(x, y)");
    let length = HostFunction::register("(s) => BigInt(s.length)");

    let greeting = greet.invoke_and_return_string(&[InvokeParam::from("guest")]);
    log.invoke(&[InvokeParam::from(&greeting)]);

    let distance = hypot.invoke_and_return_number(&[3.0.into(), 4.0.into()]);
    let chars = length.invoke_and_return_bigint(&[InvokeParam::from(&greeting)]);
    let summary = format!("distance = {distance}, greeting length = {chars}");
    log.invoke(&[InvokeParam::from(&summary)]);

    let shout = HostFunction::register("(s) => s.toUpperCase()");
    let object = shout.invoke_and_return_object(&["held by the host".into()]);
    log.invoke(&[object.into()]);
    release(object);
}
