fn main() {
    chicane_lib::run()
}
