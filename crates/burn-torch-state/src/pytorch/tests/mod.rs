
mod decode;
mod load;
