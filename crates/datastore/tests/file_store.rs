mod common;

use std::sync::Arc;

use common::{
    increment, new_counter, new_name_value, new_widget, temp_dir, Counter, NameValue, Widget,
};
use datastore::{
    delete_multi, get_all_as, register_entity, Entity, FileStore, Key, Store, StoreError, Value,
};

fn open(base: &std::path::Path) -> FileStore {
    FileStore::new("fishtest", base.to_str().expect("utf8 temp dir")).expect("open file store")
}

fn nv(name: &str, value: &str) -> NameValue {
    NameValue {
        name: name.into(),
        value: value.into(),
    }
}

fn widget(label: &str, weight: i64) -> Widget {
    Widget {
        label: label.into(),
        weight,
        key: None,
    }
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let base = temp_dir();
    let store = open(&base);
    let key = store.name_key("Variable", "dev.mode");
    store.put(&key, &nv("dev.mode", "Normal")).await.unwrap();

    let mut got = NameValue::default();
    store.get(&key, &mut got).await.unwrap();
    assert_eq!(got, nv("dev.mode", "Normal"));

    let mut missing = NameValue::default();
    let err = store
        .get(&store.name_key("Variable", "nope"), &mut missing)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NoSuchEntity));
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn create_refuses_existing_keys() {
    let base = temp_dir();
    let store = open(&base);
    let key = store.id_key("Variable", 42);
    store.create(&key, &nv("a", "1")).await.unwrap();
    let err = store.create(&key, &nv("a", "2")).await.unwrap_err();
    assert!(matches!(err, StoreError::EntityExists));

    let mut got = NameValue::default();
    store.get(&key, &mut got).await.unwrap();
    assert_eq!(got.value, "1", "failed create must not overwrite");
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn concurrent_updates_are_not_lost() {
    register_entity("FileCounter", new_counter);
    let base = temp_dir();
    let store: Arc<dyn Store> = Arc::new(open(&base));
    let key = store.name_key("FileCounter", "hits");
    store.put(&key, &Counter { n: 0 }).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let mut c = Counter::default();
            store.update(&key, &increment, &mut c).await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let mut c = Counter::default();
    store.get(&key, &mut c).await.unwrap();
    assert_eq!(c.n, 16);
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn update_of_missing_key_fails_without_writing() {
    let base = temp_dir();
    let store = open(&base);
    let key = store.name_key("FileCounter", "absent");
    let mut c = Counter::default();
    let err = store.update(&key, &increment, &mut c).await.unwrap_err();
    assert!(matches!(err, StoreError::NoSuchEntity));
    assert!(!base.join("fishtest").join("FileCounter").join("absent").exists());
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn key_part_filters_match_on_names() {
    register_entity("User", new_name_value);
    let base = temp_dir();
    let store = open(&base);
    let first = store.name_key("User", "10.foo@example.com");
    let second = store.name_key("User", "20.bar@example.com");
    store.put(&first, &nv("foo", "")).await.unwrap();
    store.put(&second, &nv("bar", "")).await.unwrap();

    let mut q = store.new_query("User", true, &["ID", "Email"]);
    q.filter("Email =", Value::from("bar@example.com")).unwrap();
    let keys = store.get_all(q.as_ref(), &mut Vec::new()).await.unwrap();
    assert_eq!(keys, vec![second.clone()]);

    let mut q = store.new_query("User", true, &["ID", "Email"]);
    q.filter("ID =", Value::Int(10)).unwrap();
    let keys = store.get_all(q.as_ref(), &mut Vec::new()).await.unwrap();
    assert_eq!(keys, vec![first.clone()]);

    // Numeric range through filter_field.
    let mut q = store.new_query("User", false, &["ID", "Email"]);
    q.filter_field("ID", ">", Value::Int(10)).unwrap();
    let mut found = Vec::new();
    let keys = store.get_all(q.as_ref(), &mut found).await.unwrap();
    assert_eq!(keys, vec![second]);
    let name = found[0].downcast_ref::<NameValue>().map(|n| n.name.as_str());
    assert_eq!(name, Some("bar"));

    // A null value matches everything.
    let mut q = store.new_query("User", true, &["ID", "Email"]);
    q.filter("Email =", Value::Null).unwrap();
    let keys = store.get_all(q.as_ref(), &mut Vec::new()).await.unwrap();
    assert_eq!(keys.len(), 2);
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn not_equal_on_a_key_part_is_rejected() {
    let base = temp_dir();
    let store = open(&base);
    store
        .put(&store.name_key("User", "10.foo@example.com"), &nv("foo", ""))
        .await
        .unwrap();

    let mut q = store.new_query("User", true, &["ID", "Email"]);
    let err = q
        .filter_field("Email", "!=", Value::from("foo@example.com"))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidOperator(ref op) if op == "!="));
    let err = q.filter("Email !=", Value::from("foo@example.com")).unwrap_err();
    assert!(matches!(err, StoreError::InvalidOperator(_)));
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn field_filters_read_entities_before_paging() {
    register_entity("Gadget", new_widget);
    let base = temp_dir();
    let store = open(&base);
    for (i, weight) in [5, 50, 7, 70, 9].into_iter().enumerate() {
        let w = widget(&format!("w{i}"), weight);
        store.put(&store.id_key("Gadget", i as i64 + 1), &w).await.unwrap();
    }

    let mut q = store.new_query("Gadget", false, &[]);
    q.filter_field("Weight", ">=", Value::Int(10)).unwrap();
    q.order("Weight");
    let (keys, widgets) = get_all_as::<Widget>(&store, q.as_ref()).await.unwrap();
    assert_eq!(keys.iter().map(|k| k.id).collect::<Vec<_>>(), vec![2, 4]);
    assert_eq!(widgets.iter().map(|w| w.weight).collect::<Vec<_>>(), vec![50, 70]);
    assert_eq!(widgets[0].key.as_ref(), Some(&keys[0]));

    let mut q = store.new_query("Gadget", true, &[]);
    q.filter_field("Weight", "<", Value::Int(10)).unwrap();
    q.offset(1);
    q.limit(1);
    let keys = store.get_all(q.as_ref(), &mut Vec::new()).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].id, 3);

    let mut q = store.new_query("Gadget", true, &[]);
    let err = q.filter_field("Weight", "!=", Value::Int(1)).unwrap_err();
    assert!(matches!(err, StoreError::InvalidOperator(_)));
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn pages_partition_the_filtered_results() {
    register_entity("Page", new_widget);
    let base = temp_dir();
    let store = open(&base);
    for i in 1..=10 {
        let w = widget(&format!("p{i}"), i * 10);
        store.put(&store.id_key("Page", i), &w).await.unwrap();
    }

    let query = |offset: Option<usize>, limit: Option<usize>| {
        let mut q = store.new_query("Page", true, &[]);
        q.filter_field("Weight", ">=", Value::Int(40)).unwrap();
        q.order("Weight");
        if let Some(o) = offset {
            q.offset(o);
        }
        if let Some(l) = limit {
            q.limit(l);
        }
        q
    };

    let all = store.get_all(query(None, None).as_ref(), &mut Vec::new()).await.unwrap();
    let total = all.len();
    assert_eq!(total, 7);

    let page_size = 3;
    let mut paged: Vec<Key> = Vec::new();
    for offset in (0..=total + page_size).step_by(page_size) {
        let q = query(Some(offset), Some(page_size));
        let page = store.get_all(q.as_ref(), &mut Vec::new()).await.unwrap();
        let expected = page_size.min(total.saturating_sub(offset));
        assert_eq!(page.len(), expected, "page at offset {offset}");
        paged.extend(page);
    }
    assert_eq!(paged, all, "pages cover every result once, in order");
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn time_like_strings_still_match_as_strings() {
    register_entity("Stamp", new_widget);
    let base = temp_dir();
    let store = open(&base);
    let stamped = store.name_key("Stamp", "stamped");
    store
        .put(&stamped, &widget("2024-05-01T10:00:00Z", 1))
        .await
        .unwrap();
    store
        .put(&store.name_key("Stamp", "plain"), &widget("plain", 2))
        .await
        .unwrap();

    let mut q = store.new_query("Stamp", true, &[]);
    q.filter_field("Label", "=", Value::from("2024-05-01T10:00:00Z"))
        .unwrap();
    let keys = store.get_all(q.as_ref(), &mut Vec::new()).await.unwrap();
    assert_eq!(keys, vec![stamped]);
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn widgets_end_to_end() {
    register_entity("Widget", new_widget);
    let base = temp_dir();
    let store = open(&base);

    let a = store
        .create(&store.incomplete_key("Widget"), &widget("a", 0))
        .await
        .unwrap();
    let b = store
        .create(&store.incomplete_key("Widget"), &widget("b", 0))
        .await
        .unwrap();
    assert_ne!(a, b);
    assert!(a.id > 0 && b.id > 0);

    // Unordered results follow the file names.
    let mut by_name = vec![a.clone(), b.clone()];
    by_name.sort_by(|x, y| x.name.cmp(&y.name));

    let mut q = store.new_query("Widget", false, &[]);
    q.limit(1);
    q.offset(1);
    let mut found: Vec<Box<dyn Entity>> = Vec::new();
    let keys = store.get_all(q.as_ref(), &mut found).await.unwrap();
    assert_eq!(keys, vec![by_name[1].clone()]);
    let w = found.remove(0).downcast::<Widget>().unwrap();
    assert_eq!(w.key.as_ref(), Some(&by_name[1]));

    store.delete(&a).await.unwrap();
    let mut gone = Widget::default();
    assert!(matches!(
        store.get(&a, &mut gone).await,
        Err(StoreError::NoSuchEntity)
    ));
    let mut kept = Widget::default();
    store.get(&b, &mut kept).await.unwrap();
    assert_eq!(kept.label, "b");
    let _ = std::fs::remove_dir_all(base);
}

#[tokio::test]
async fn delete_multi_reports_partial_progress() {
    let base = temp_dir();
    let store = open(&base);
    let keys: Vec<_> = (1..=3).map(|i| store.id_key("Variable", i)).collect();
    for k in &keys {
        store.put(k, &nv("x", "y")).await.unwrap();
    }
    assert_eq!(delete_multi(&store, &keys[..2]).await.unwrap(), 2);

    match delete_multi(&store, &keys).await {
        Err(StoreError::PartialDelete { deleted, source }) => {
            assert_eq!(deleted, 0);
            assert!(matches!(*source, StoreError::NoSuchEntity));
        }
        other => panic!("expected partial delete, got {:?}", other.err()),
    }
    let _ = std::fs::remove_dir_all(base);
}
