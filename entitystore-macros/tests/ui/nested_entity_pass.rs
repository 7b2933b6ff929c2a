use entitystore::schema::Entity;
use entitystore_macros::Entity;

#[derive(Debug, Default, PartialEq, Entity)]
struct Address {
    city: String,
    zip: u32,
}

#[derive(Debug, Default, PartialEq, Entity)]
struct Person {
    name: String,
    #[entity(rename = "Address", nested)]
    address: Option<Address>,
    #[entity(nested)]
    manager: Option<Box<Person>>,
}

fn main() {
    let schema = Person::schema();
    assert!(schema.field("Address").unwrap().is_nested());
    assert!(schema.field("manager").unwrap().is_nested());
    assert!(Person::empty().is_some());
}
