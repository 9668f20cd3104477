#![no_main]

use chainscry::repair::{RepairEngine, RepairOutcome};
use chainscry::validation::ImageValidator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let validator = ImageValidator::with_defaults();
    let _ = validator.validate(data);

    // Whatever repair hands back must validate cleanly.
    if let RepairOutcome::Valid { data: fixed, .. } = RepairEngine::new(&validator).repair(data) {
        assert!(validator.validate(&fixed).verdict.is_valid());
    }
});
