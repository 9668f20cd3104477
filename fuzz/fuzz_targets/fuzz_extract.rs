#![no_main]

use chainscry::extraction::Dispatcher;
use chainscry::types::{BlockRef, Transaction};
use libfuzzer_sys::fuzz_target;

// First byte splits the input between an output script and a witness stack.
fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let at = (split as usize).min(rest.len());
    let (script, witness) = rest.split_at(at);

    let items: Vec<Vec<u8>> = witness.chunks(97).map(<[u8]>::to_vec).collect();
    let tx = Transaction::new("00".repeat(32))
        .with_output(script.to_vec())
        .with_witness(items);

    for candidate in Dispatcher::default().dispatch(&tx, BlockRef::Unconfirmed) {
        assert!(!candidate.data.is_empty());
        assert!(!candidate.sources.is_empty());
    }
});
