use entitystore::schema::Entity;
use entitystore_macros::Entity;

#[derive(Debug, Default, PartialEq, Entity)]
struct Widget {
    #[entity(rename = "Name")]
    name: String,
    count: i32,
    tags: Vec<String>,
    #[entity(scalar)]
    label: String,
    #[entity(skip)]
    #[allow(dead_code)]
    cached: u64,
}

fn main() {
    let schema = Widget::schema();
    assert_eq!(schema.fields().len(), 4);
    assert!(schema.field("Name").unwrap().is_sequence());
    assert!(!schema.field("label").unwrap().is_sequence());
    assert!(schema.field("cached").is_none());
    assert_eq!(Widget::empty(), Some(Widget::default()));
}
