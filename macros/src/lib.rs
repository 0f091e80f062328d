use proc_macro::TokenStream;

mod generate_tuples;

/// Invokes a macro implementation once per tuple arity in a range, passing
/// generated generic parameter names.
#[proc_macro]
pub fn generate_tuples(input: TokenStream) -> TokenStream {
    generate_tuples::impl_generate_tuples(input)
}
