use syn::{GenericArgument, PathArguments, Type};

/// Maps a Rust field type to its storage type.
///
/// Returns a tuple containing:
/// 1. The `FieldType` variant name (`"Integer"`, `"Real"`, `"Text"` or `"Blob"`).
/// 2. Whether the field is nullable (`Option<T>`).
pub fn rust_type_to_storage(ty: &Type) -> (&'static str, bool) {
    let Type::Path(type_path) = ty else {
        return ("Text", false);
    };
    let Some(segment) = type_path.path.segments.last() else {
        return ("Text", false);
    };
    let type_name = segment.ident.to_string();

    if type_name == "Option" {
        if let Some(inner) = first_type_argument(&segment.arguments) {
            let (storage, _) = rust_type_to_storage(inner);
            return (storage, true);
        }
    }

    let storage = match type_name.as_str() {
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "bool" => "Integer",
        "f32" | "f64" => "Real",
        "Vec" if first_type_argument(&segment.arguments).is_some_and(is_u8) => "Blob",
        "String" | "DateTime" | "NaiveDateTime" | "NaiveDate" => "Text",
        // `Value` and anything unknown are stored with text affinity.
        _ => "Text",
    };
    (storage, false)
}

fn first_type_argument(arguments: &PathArguments) -> Option<&Type> {
    let PathArguments::AngleBracketed(args) = arguments else {
        return None;
    };
    args.args.iter().find_map(|arg| match arg {
        GenericArgument::Type(ty) => Some(ty),
        _ => None,
    })
}

fn is_u8(ty: &Type) -> bool {
    matches!(ty, Type::Path(path) if path.path.is_ident("u8"))
}
