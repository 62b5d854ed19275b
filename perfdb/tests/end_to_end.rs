use perfdb::testing_common::run_end_to_end_test;

#[test]
fn test_end_to_end_1_thread() {
    run_end_to_end_test(1, 2_000);
}

#[test]
fn test_end_to_end_8_threads() {
    run_end_to_end_test(8, 1_000);
}
