#![no_main]
use arbitrary::Arbitrary;
use cluster_store::{Container, StoreConfig};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

#[derive(Arbitrary, Debug)]
enum Op {
    Write { stream: u8, data: Vec<u8> },
    Append { stream: u8, data: Vec<u8> },
    Truncate { stream: u8, len: u16 },
    Delete { stream: u8 },
    Rename { from: u8, to: u8 },
    Flush,
}

fn name(stream: u8) -> String {
    format!("s{}", stream % 4)
}

fuzz_target!(|ops: Vec<Op>| {
    let config = StoreConfig {
        cluster_capacity: 16,
        ..StoreConfig::default()
    };
    let mut store = match Container::in_memory(config) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut model: HashMap<String, Vec<u8>> = HashMap::new();

    for op in ops.iter().take(64) {
        match op {
            Op::Write { stream, data } => {
                store.write(name(*stream), data).unwrap();
                model.insert(name(*stream), data.clone());
            }
            Op::Append { stream, data } => {
                store.append(name(*stream), data).unwrap();
                model.entry(name(*stream)).or_default().extend_from_slice(data);
            }
            Op::Truncate { stream, len } => {
                if let Some(content) = model.get_mut(&name(*stream)) {
                    let len = (*len as usize).min(content.len());
                    store.truncate(name(*stream), len as u64).unwrap();
                    content.truncate(len);
                }
            }
            Op::Delete { stream } => {
                if model.remove(&name(*stream)).is_some() {
                    store.delete(name(*stream)).unwrap();
                }
            }
            Op::Rename { from, to } => {
                let (from, to) = (name(*from), name(*to));
                if from != to && model.contains_key(&from) && !model.contains_key(&to) {
                    store.rename(&from, &to).unwrap();
                    if let Some(content) = model.remove(&from) {
                        model.insert(to, content);
                    }
                }
            }
            Op::Flush => store.flush().unwrap(),
        }
        store.engine().check_integrity().unwrap();
    }

    for (stream, content) in &model {
        assert_eq!(&store.read(stream).unwrap(), content);
    }

    let image = store.into_bytes().unwrap();
    let mut store = Container::from_bytes(image, StoreConfig::read_only()).unwrap();
    for (stream, content) in &model {
        assert_eq!(&store.read(stream).unwrap(), content);
    }
});
