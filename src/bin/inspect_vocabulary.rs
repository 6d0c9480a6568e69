use anyhow::{Context, Result};
use std::path::PathBuf;

use atmofed::model::Ri;
use atmofed::vocabulary::{MappingContext, Vocabulary};

fn main() -> Result<()> {
    // Optional path to a vocabulary file; the built-in table otherwise
    let path = std::env::args().nth(1).map(PathBuf::from);

    let vocabulary = match &path {
        Some(path) => {
            println!("Inspecting vocabulary file: {}", path.display());
            Vocabulary::from_file(path)
                .with_context(|| format!("invalid vocabulary {}", path.display()))?
        }
        None => {
            println!("Inspecting built-in vocabulary");
            Vocabulary::builtin().context("invalid built-in vocabulary")?
        }
    };

    println!("\n=== VOCABULARY {} ===", vocabulary.version());

    println!("\nVariables:");
    for variable in vocabulary.variables() {
        println!("  {} [{}]", variable.name, variable.unit);
        if !variable.ecv.is_empty() {
            println!("    ECV: {}", variable.ecv.join(", "));
        }
        for ri in Ri::ALL {
            let native = vocabulary.native_names(ri, &variable.name, MappingContext::Any);
            if !native.is_empty() {
                println!("    {}: {}", ri, native.join(", "));
            }
        }
    }

    println!("\nECV groups:");
    for (group, members) in vocabulary.ecv_groups() {
        let members: Vec<&str> = members.iter().map(String::as_str).collect();
        println!("  {}: {}", group, members.join(", "));
    }

    println!("\nConversions:");
    for ri in Ri::ALL {
        for mapping in vocabulary.mappings(ri).filter(|m| !m.conversion.is_identity()) {
            println!(
                "  {} {} [{}] -> {}: x * {} / {} + {}",
                ri,
                mapping.native_name,
                mapping.native_unit.as_deref().unwrap_or("?"),
                mapping.canonical,
                mapping.conversion.multiply,
                mapping.conversion.divide,
                mapping.conversion.offset
            );
        }
    }

    println!("\nCatalogs:");
    for ri in Ri::ALL {
        let catalog: Vec<String> = vocabulary.catalog(ri).into_iter().collect();
        println!("  {} ({}): {}", ri, catalog.len(), catalog.join(", "));
    }

    println!("\nQuality flags:");
    for flag in &vocabulary.table().quality_flags {
        println!("  {} {:>5} -> {}", flag.ri, flag.native, flag.flag.as_str());
    }

    println!("\nVocabulary is valid");
    Ok(())
}
