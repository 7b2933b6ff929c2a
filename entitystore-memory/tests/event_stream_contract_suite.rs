//! Runs the stream contract suite against both in-process backends.

entitystore_testing::event_stream_contract_tests! {
    suite = in_memory,
    make_store = entitystore_memory::InMemoryEventStore::new,
}

entitystore_testing::event_stream_contract_tests! {
    suite = log_backend,
    make_store = || {
        entitystore::log::LogEventStore::new(entitystore_memory::InMemoryLogConnection::new())
    },
}
