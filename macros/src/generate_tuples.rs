use proc_macro2::Ident;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    LitInt, Result,
};

struct GenerateTuplesInput {
    macro_impl: Ident,
    min: usize,
    max: usize,
}

impl Parse for GenerateTuplesInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let macro_impl = input.parse::<Ident>()?;
        input.parse::<syn::token::Comma>()?;
        let first = input.parse::<LitInt>()?.base10_parse()?;
        if input.parse::<syn::token::Comma>().is_ok() {
            let max = input.parse::<LitInt>()?.base10_parse()?;
            Ok(GenerateTuplesInput {
                macro_impl,
                min: first,
                max,
            })
        } else {
            Ok(GenerateTuplesInput {
                macro_impl,
                min: 1,
                max: first,
            })
        }
    }
}

pub fn impl_generate_tuples(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let GenerateTuplesInput {
        macro_impl,
        min,
        max,
    } = syn::parse_macro_input!(input as GenerateTuplesInput);

    let mut gen = Vec::new();
    let mut generics = Vec::new();

    for i in 0..max {
        let param = Ident::new(&format!("P{}", i), proc_macro2::Span::call_site());
        generics.push(quote! { #param });

        if i + 1 >= min {
            gen.push(quote! {
                #macro_impl!(#(#generics),*);
            });
        }
    }

    let gen = quote! {
        #(#gen)*
    };
    gen.into()
}
