use rand::Rng;
use shadowkv::{MemoryPager, Tree};
use std::{
    collections::HashMap,
    io::{self, Write},
};

type Key = u64;
type Data = Vec<u8>;

#[derive(Debug, Clone)]
enum Instruction {
    Set(Key, Data),
    Get(Key),
}

fn validate(reference: &HashMap<Key, Data>, tree: &Tree<MemoryPager>) -> io::Result<bool> {
    for (key, value) in reference.iter() {
        let found = tree
            .get(&key.to_le_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if found.as_ref() != Some(value) {
            log::error!("MISMATCH [key={}][expected={:?}][got={:?}]", key, value, found);
            return Ok(false);
        }
    }
    Ok(true)
}

fn generate_instruction(reference: &HashMap<Key, Data>) -> Instruction {
    use rand::{
        distributions::{Distribution, Uniform},
        seq::IteratorRandom,
    };
    let mut rng = rand::thread_rng();
    if rng.gen_bool(0.8) {
        // mostly fresh keys, sometimes an overwrite of a known one
        let key = if rng.gen_bool(0.3) {
            match reference.keys().choose(&mut rng) {
                Some(key) => *key,
                None => return generate_instruction(reference),
            }
        } else {
            rng.gen()
        };
        let data_len: usize = Uniform::from(0..64).sample(&mut rng);
        let data: Vec<u8> = Uniform::from(0..128u8)
            .sample_iter(&mut rng)
            .take(data_len)
            .collect();
        Instruction::Set(key, data)
    } else {
        let key = match reference.keys().choose(&mut rng) {
            Some(key) => *key,
            None => return generate_instruction(reference),
        };
        Instruction::Get(key)
    }
}

fn main() -> io::Result<()> {
    env_logger::init();

    let tree = Tree::with_order(MemoryPager::new(), 5).expect("failed to open tree");
    let mut reference = HashMap::new();
    let mut instructions = vec![];
    let mut file = std::fs::File::create("instructions")?;
    loop {
        let instruction = generate_instruction(&reference);
        match &instruction {
            Instruction::Set(key, data) => {
                tree.set(&key.to_le_bytes(), data).expect("set failed");
                reference.insert(*key, data.clone());
            }
            Instruction::Get(key) => {
                let expected = reference.get(key);
                let found = tree.get(&key.to_le_bytes()).expect("get failed");
                if found.as_ref() != expected {
                    log::error!("GET_MISMATCH [key={}]", key);
                }
            }
        }
        instructions.push(instruction);
        if !validate(&reference, &tree)? {
            for inst in instructions {
                match inst {
                    Instruction::Set(key, value) => {
                        writeln!(file, "SET {} {:?}", key, value)?;
                    }
                    Instruction::Get(key) => {
                        writeln!(file, "GET {}", key)?;
                    }
                }
            }
            break;
        }
    }
    Ok(())
}
