use entitystore::schema::Entity;
use entitystore_macros::Entity;

#[derive(Entity)]
#[entity(no_default)]
struct Connection {
    #[allow(dead_code)]
    endpoint: String,
}

fn main() {
    assert!(Connection::empty().is_none());
    assert_eq!(Connection::schema().fields().len(), 1);
}
